pub mod error;
pub mod meta;
pub mod native;
pub mod signal;
pub mod value;
pub mod variant;

pub use error::BridgeError;
pub use meta::*;
pub use native::*;
pub use signal::*;
pub use value::*;
pub use variant::*;
