pub mod backoff;
pub mod headers;
pub mod pacing;
pub mod requester;

pub use headers::HeaderProfile;
pub use requester::{RequesterConfig, ResilientRequester};
