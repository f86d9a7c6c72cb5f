pub mod session;
pub mod tuition;
