pub mod error;
pub mod filters;
pub mod key;
pub mod metadata;
pub mod period;
pub mod remote;
pub mod store;

pub use error::*;
pub use filters::*;
pub use key::*;
pub use metadata::*;
pub use period::*;
pub use remote::*;
pub use store::*;
