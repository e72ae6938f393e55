use std::time::{Duration, Instant};

use log::trace;

/// How many times a task runs before it is dropped from the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Iterations {
    Forever,
    Times(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

struct Task {
    id: TaskId,
    name: String,
    interval: Duration,
    remaining: Iterations,
    next_run: Instant,
    callback: Box<dyn FnMut()>,
}

/// Cooperative task list driven from the device run loop.
///
/// Nothing here is preemptive: `execute` runs whatever is due and returns.
/// Callbacks run on the loop thread and must not block.
pub struct Scheduler {
    tasks: Vec<Task>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            next_id: 0,
        }
    }

    /// Register a task. The first run is one `interval` from now. A task
    /// with `Times(0)` is never run.
    pub fn add_task<F>(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        iterations: Iterations,
        callback: F,
    ) -> TaskId
    where
        F: FnMut() + 'static,
    {
        self.add_task_at(Instant::now(), name, interval, iterations, callback)
    }

    /// Register a task relative to an explicit clock reading
    pub fn add_task_at<F>(
        &mut self,
        now: Instant,
        name: impl Into<String>,
        interval: Duration,
        iterations: Iterations,
        callback: F,
    ) -> TaskId
    where
        F: FnMut() + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        let name = name.into();
        if iterations == Iterations::Times(0) {
            trace!("Task '{}' has no iterations, not scheduled", name);
            return id;
        }

        self.tasks.push(Task {
            id,
            name,
            interval,
            remaining: iterations,
            next_run: now + interval,
            callback: Box::new(callback),
        });

        id
    }

    /// Remove a task. Returns false if it already finished or never existed.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != id);
        self.tasks.len() != before
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Time until the earliest pending task is due, if any
    pub fn time_to_next(&self, now: Instant) -> Option<Duration> {
        self.tasks
            .iter()
            .map(|task| task.next_run.saturating_duration_since(now))
            .min()
    }

    pub fn execute(&mut self) -> usize {
        self.execute_at(Instant::now())
    }

    /// Run every task whose deadline has passed. Returns the number of
    /// callbacks invoked.
    pub fn execute_at(&mut self, now: Instant) -> usize {
        let mut ran = 0;

        for task in self.tasks.iter_mut() {
            if task.next_run > now {
                continue;
            }

            trace!("Running task '{}'", task.name);
            (task.callback)();
            ran += 1;

            // A late task is rescheduled from now rather than catching up
            task.next_run = now + task.interval;
            if let Iterations::Times(n) = task.remaining {
                task.remaining = Iterations::Times(n.saturating_sub(1));
            }
        }

        self.tasks
            .retain(|task| task.remaining != Iterations::Times(0));

        ran
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
