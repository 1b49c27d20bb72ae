use std::sync::{OnceLock, mpsc};

use parking_lot::Mutex;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide host executor for bridge calls whose outcome the guest does
/// not await. Tasks run in dispatch order on a dedicated thread, so a slow
/// or failing host closure can never back-pressure guest execution.
pub(crate) struct HostDispatcher {
    tasks: Mutex<mpsc::Sender<Task>>,
}

impl HostDispatcher {
    fn new() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        std::thread::Builder::new()
            .name("cordon-host-dispatch".to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })?;

        Ok(Self {
            tasks: Mutex::new(tx),
        })
    }

    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        // The receiver lives for the process; a send can only fail during
        // teardown, where dropping the task is the documented behavior.
        let _ = self.tasks.lock().send(Box::new(task));
    }
}

pub(crate) fn host_dispatcher() -> std::io::Result<&'static HostDispatcher> {
    static GLOBAL_DISPATCHER: OnceLock<
        core::result::Result<HostDispatcher, (std::io::ErrorKind, String)>,
    > = OnceLock::new();

    let dispatcher = GLOBAL_DISPATCHER
        .get_or_init(|| HostDispatcher::new().map_err(|e| (e.kind(), e.to_string())));
    match dispatcher {
        Ok(dispatcher) => Ok(dispatcher),
        Err((kind, message)) => Err(std::io::Error::new(*kind, message.clone())),
    }
}
