//! An in-process browser and identity provider
//!
//! [`SimulatedBrowser`] plays the part of the user agent: it opens frames and
//! popups, follows redirects through a [`MockAuthority`], runs the bounce page
//! in each context, and delivers the replies to the application window. It
//! lets the whole refresh protocol run in a test or a demo without a real
//! browser or network.

mod authority;
mod browser;

pub use authority::{MockAuthority, MockAuthorityError, TokenRequest};
pub use browser::{OpenedContext, SimulatedBrowser};
