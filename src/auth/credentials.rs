use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::ids::PlayerId;

const BASIC_SCHEME: &str = "Basic ";

/// Identity and secret carried by a `Basic` authorization header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicCredentials {
    pub player_id: PlayerId,
    pub secret: String,
}

/// Parses `Basic base64(id:secret)`.
///
/// Returns `None` for any other scheme, undecodable payloads, a missing colon,
/// an empty secret, or an identity that is not UUID-shaped. Surrounding
/// whitespace of both halves is ignored.
pub fn parse_basic(header: &str) -> Option<BasicCredentials> {
    let encoded = header.trim().strip_prefix(BASIC_SCHEME)?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let pair = String::from_utf8(decoded).ok()?;
    let (id, secret) = pair.split_once(':')?;

    let secret = secret.trim();
    if secret.is_empty() {
        return None;
    }
    let player_id = PlayerId::parse(id.trim()).ok()?;
    Some(BasicCredentials {
        player_id,
        secret: secret.to_owned(),
    })
}

/// Builds a header value accepted by [`parse_basic`].
pub fn basic_header(player_id: &str, secret: &str) -> String {
    format!("{BASIC_SCHEME}{}", STANDARD.encode(format!("{player_id}:{secret}")))
}
