pub(crate) mod accountant;
pub(crate) mod core;
pub(crate) mod dispatch;
pub(crate) mod heap;
pub(crate) mod watchdog;
pub(crate) mod worker;
