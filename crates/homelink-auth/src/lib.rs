//! Homelink Auth - PIN pairing and client identity
//!
//! Implements the trust-establishment flow between companion devices and the
//! coordinator:
//!
//! 1. The coordinator issues a short-lived 6-digit PIN
//!    (`PairingSessionManager::generate_pin`)
//! 2. The device submits the PIN together with its name, type, and public key
//!    (`ClientRegistry::complete_pairing`)
//! 3. The coordinator binds the public key to a new client identity and
//!    issues an opaque trust token ("certificate"), returned exactly once
//! 4. The device presents `client_id` + certificate to authenticate REST
//!    calls and the realtime channel (`ClientRegistry::verify_certificate`)
//!
//! Expired or consumed PINs are indistinguishable to callers; both fail with
//! the same generic authentication error.

pub mod error;
pub mod registry;
pub mod session;

pub use error::{AuthError, AuthResult};
pub use registry::{ClientRegistry, PairingRequest};
pub use session::{PairingSessionManager, PinIssued};
