pub mod history;
pub mod queue;
pub mod run;
pub mod status;
pub mod trigger;
