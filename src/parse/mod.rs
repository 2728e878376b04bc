pub mod passthrough;
pub mod sse;
