//! Minting and verification of the signed credentials that make the
//! multipart upload protocol stateless: every claim a part upload or
//! completion needs travels inside an HMAC-SHA256 signed token, so the hot
//! path never touches the database.

mod broker;
mod secret;

pub use broker::{
    KeyBroker,
    UploadTokenClaims,
};
pub use secret::Secret;
