pub mod client;
pub mod error;
pub mod types;

pub use client::{ApiClient, YmgalClient};
pub use error::HttpFailure;
pub use types::{Candidate, OrgInfo, RawResponse, SearchHit};
