use trellis_core::config::GatewayConfig;

/// Result of a successful authentication. The key name doubles as the
/// acting user id for ownership and approvals.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub user: String,
}

/// Validate a Bearer key against the configured api_keys.
///
/// Returns `Some(AuthResult)` on success, `None` on auth failure. With no
/// keys configured the gateway runs single-user: every request acts as
/// `anonymous`.
pub fn validate_auth(config: &GatewayConfig, bearer: Option<&str>) -> Option<AuthResult> {
    if let Some(bearer_val) = bearer {
        for ak in &config.api_keys {
            if ak.key == bearer_val {
                return Some(AuthResult {
                    user: ak.name.clone(),
                });
            }
        }
        return None; // Bearer provided but no match
    }

    if config.api_keys.is_empty() {
        Some(AuthResult {
            user: "anonymous".into(),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::ApiKeyConfig;

    fn gateway(api_keys: Vec<ApiKeyConfig>) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:18790".to_string(),
            api_keys,
        }
    }

    #[test]
    fn no_keys_means_anonymous() {
        let config = gateway(vec![]);
        let auth = validate_auth(&config, None).unwrap();
        assert_eq!(auth.user, "anonymous");
        // A bearer with nothing to match against is still rejected
        assert!(validate_auth(&config, Some("anything")).is_none());
    }

    #[test]
    fn bearer_key_resolves_user() {
        let config = gateway(vec![ApiKeyConfig {
            name: "ops".into(),
            key: "tk_abc".into(),
        }]);

        let auth = validate_auth(&config, Some("tk_abc")).unwrap();
        assert_eq!(auth.user, "ops");

        assert!(validate_auth(&config, Some("wrong")).is_none());
        // Keys configured: no anonymous fallback
        assert!(validate_auth(&config, None).is_none());
    }
}
