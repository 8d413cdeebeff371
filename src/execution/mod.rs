pub mod approvals;
pub mod chain;
pub mod contracts;
pub mod swap;
