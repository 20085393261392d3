pub mod call;
pub mod ctl;
pub mod service;
pub mod status;
