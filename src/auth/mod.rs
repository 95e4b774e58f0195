//! BankID login: state, token extraction, success detection and the
//! controller that ties them together.

pub mod controller;
pub mod deeplink;
pub mod detector;
pub mod extractor;
pub mod state;

pub use controller::AuthenticationController;
pub use deeplink::DeepLinkBuilder;
pub use detector::{Detection, LoginUrlHeuristics, SuccessDetector};
pub use extractor::{Endpoint, PollResult, TokenExtractor};
pub use state::{
    AuthEvent, AuthPhase, AuthStateHandle, AuthenticationState, DeviceMode, ParseDeviceModeError,
    StateUpdate,
};
