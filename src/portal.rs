use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use log::{error, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::device::{PortalEvent, PortalSender, WebPortal};

pub const HTTP_PORT: u16 = 80;

/// Query field carrying the text to broadcast
pub const BROADCAST_ARG: &str = "BROADCAST";

pub const FORM_HTML: &str = "<form>Text to Broadcast<br><input type='text' name='BROADCAST'><br><br><input type='submit' value='Submit'></form>";

#[derive(Clone)]
struct PortalState {
    events: PortalSender,
    forward_broadcasts: bool,
}

/// Single-page web portal with the broadcast form on `GET /`
pub struct PortalServer {
    addr: SocketAddr,
    forward_broadcasts: bool,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl PortalServer {
    pub fn new(addr: SocketAddr, forward_broadcasts: bool) -> Self {
        Self {
            addr,
            forward_broadcasts,
            local_addr: None,
            task: None,
        }
    }

    /// Address actually bound, once `begin` has succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

fn router(state: PortalState) -> Router {
    Router::new()
        .route("/", get(broadcast_form))
        .with_state(state)
}

/// Serve the form, logging a submitted broadcast
async fn broadcast_form(
    State(state): State<PortalState>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    if let Some(msg) = params.get(BROADCAST_ARG) {
        info!("arg: {}", msg);

        if state.forward_broadcasts {
            match state.events.try_send(PortalEvent::Broadcast(msg.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Portal queue full, dropping broadcast '{}'", msg)
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Run loop is gone, dropping broadcast from portal")
                }
            }
        }
    }

    Html(FORM_HTML)
}

impl WebPortal for PortalServer {
    fn begin(&mut self, events: PortalSender) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("Web portal needs a running tokio runtime")?;

        let listener = std::net::TcpListener::bind(self.addr)
            .with_context(|| format!("Failed to bind web portal on {}", self.addr))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let listener = {
            let _guard = handle.enter();
            tokio::net::TcpListener::from_std(listener)?
        };

        let app = router(PortalState {
            events,
            forward_broadcasts: self.forward_broadcasts,
        });

        if let Some(previous) = self.task.take() {
            previous.abort();
        }
        self.task = Some(handle.spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Web portal stopped: {}", e);
            }
        }));

        info!("Web portal listening on http://{}", local_addr);
        self.local_addr = Some(local_addr);

        Ok(())
    }
}

impl Drop for PortalServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use crate::device::portal_channel;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_form_is_always_served() {
        let (events, mut rx) = portal_channel();
        let app = router(PortalState {
            events,
            forward_broadcasts: false,
        });

        let (status, body) = get(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, FORM_HTML);

        // Logged only, nothing reaches the mesh
        let (status, body) = get(app, "/?BROADCAST=hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, FORM_HTML);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarding_enabled() {
        let (events, mut rx) = portal_channel();
        let app = router(PortalState {
            events,
            forward_broadcasts: true,
        });

        get(app.clone(), "/?BROADCAST=lights+on").await;
        get(app, "/?other=1").await;

        assert_eq!(
            rx.try_recv().unwrap(),
            PortalEvent::Broadcast("lights on".to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_broadcasts() {
        let (events, mut rx) = mpsc::channel(1);
        let app = router(PortalState {
            events,
            forward_broadcasts: true,
        });

        let (status, _) = get(app.clone(), "/?BROADCAST=first").await;
        assert_eq!(status, StatusCode::OK);
        // Nothing drained yet, so this one has nowhere to go
        let (status, body) = get(app, "/?BROADCAST=second").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, FORM_HTML);

        assert_eq!(
            rx.try_recv().unwrap(),
            PortalEvent::Broadcast("first".to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (events, _rx) = portal_channel();
        let app = router(PortalState {
            events,
            forward_broadcasts: false,
        });

        let (status, _) = get(app, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_begin_requires_runtime() {
        let (events, _rx) = portal_channel();
        let mut portal = PortalServer::new("127.0.0.1:0".parse().unwrap(), false);
        assert!(portal.begin(events).is_err());
        assert_eq!(portal.local_addr(), None);
    }

    #[tokio::test]
    async fn test_begin_serves_over_tcp() {
        let (events, mut rx) = portal_channel();
        let mut portal = PortalServer::new("127.0.0.1:0".parse().unwrap(), true);
        portal.begin(events).unwrap();
        let addr = portal.local_addr().unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /?BROADCAST=hi HTTP/1.1\r\nHost: portal\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("Text to Broadcast"));
        assert_eq!(rx.recv().await, Some(PortalEvent::Broadcast("hi".to_string())));
    }
}
