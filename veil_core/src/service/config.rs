/*! Per-endpoint configuration options.
*/

use std::collections::HashSet;
use std::path::PathBuf;

use veil_packet::service_info::{Address, Tag};

/// Recognized options of a hidden-service endpoint. Unknown keys are
/// ignored so configurations stay forward compatible.
#[derive(Clone, Debug, Default)]
pub struct EndpointConfig {
    /// Path the identity is loaded from or persisted to. Without it the
    /// identity lives in memory only.
    pub keyfile: Option<PathBuf>,
    /// Topic tag attached to our published introset.
    pub tag: Tag,
    /// Tags to keep looked up and aligned to.
    pub prefetch_tags: HashSet<Tag>,
    /// Addresses to keep conversations open with.
    pub prefetch_addrs: HashSet<Address>,
    /// Network namespace for isolation; the endpoint loop runs isolated
    /// when set.
    pub netns: Option<String>,
}

impl EndpointConfig {
    /// Apply one `key=value` option. Returns true when the key was
    /// recognized and well formed.
    pub fn set_option(&mut self, key: &str, value: &str) -> bool {
        match key {
            "keyfile" => {
                self.keyfile = Some(PathBuf::from(value));
                true
            }
            "tag" => {
                self.tag = Tag::new(value);
                info!("setting tag to {}", self.tag);
                true
            }
            "prefetch-tag" => {
                self.prefetch_tags.insert(Tag::new(value));
                true
            }
            "prefetch-addr" => match value.parse::<Address>() {
                Ok(addr) => {
                    self.prefetch_addrs.insert(addr);
                    true
                }
                Err(()) => {
                    warn!("invalid prefetch-addr {}", value);
                    false
                }
            },
            "netns" => {
                self.netns = Some(value.to_owned());
                true
            }
            _ => {
                trace!("ignoring unknown endpoint option {}", key);
                false
            }
        }
    }
}
