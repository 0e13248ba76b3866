use crate::peer::types::ServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prefix the ICE server URL with `stun:`/`turn:` when it has no scheme.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if ["turn:", "turns:", "stun:", "stuns:"]
        .iter()
        .any(|s| config.url.starts_with(s))
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
