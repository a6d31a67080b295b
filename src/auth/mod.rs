pub mod authenticator;
pub mod pam_backend;

pub use authenticator::{Authenticator, Credential};
pub use pam_backend::PamAuthenticator;
