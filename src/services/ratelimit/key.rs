//! Rate limit key generation
//!
//! A key template is a colon-separated list of dimensions (`ip`, `user`, `route`).
//! Keys are `{prefix}:{scope}:{limit name}:{template}:{value}:{value}...`, with `:` and
//! `%` in values percent-escaped so distinct subjects can never collide. A global and a
//! route limit sharing a name still get separate buckets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::LimitDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Ip,
    User,
    Route,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Ip => "ip",
            Dimension::User => "user",
            Dimension::Route => "route",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key dimension `{0}` is not available for this request")]
    MissingDimension(Dimension),
    #[error("invalid key template `{0}`")]
    InvalidTemplate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyTemplate {
    dimensions: Vec<Dimension>,
}

impl KeyTemplate {
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }
}

impl FromStr for KeyTemplate {
    type Err = KeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut dimensions = Vec::new();
        for part in raw.split(':') {
            let dimension = match part.trim().to_ascii_lowercase().as_str() {
                "ip" => Dimension::Ip,
                "user" => Dimension::User,
                "route" => Dimension::Route,
                _ => return Err(KeyError::InvalidTemplate(raw.to_string())),
            };
            if dimensions.contains(&dimension) {
                return Err(KeyError::InvalidTemplate(raw.to_string()));
            }
            dimensions.push(dimension);
        }
        Ok(Self { dimensions })
    }
}

impl TryFrom<String> for KeyTemplate {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyTemplate> for String {
    fn from(template: KeyTemplate) -> Self {
        template.to_string()
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dimension) in self.dimensions.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            f.write_str(dimension.as_str())?;
        }
        Ok(())
    }
}

/// Values a key can be built from. Absent values make dependent limits inapplicable.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSubject {
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub route: Option<String>,
}

impl RateLimitSubject {
    fn value(&self, dimension: Dimension) -> Option<&str> {
        let value = match dimension {
            Dimension::Ip => self.client_ip.as_deref(),
            Dimension::User => self.user_id.as_deref(),
            Dimension::Route => self.route.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl KeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn generate(
        &self,
        definition: &LimitDefinition,
        subject: &RateLimitSubject,
    ) -> Result<String, KeyError> {
        let mut key = format!(
            "{}:{}:{}:{}",
            self.prefix,
            definition.scope.as_str(),
            escape(&definition.name),
            definition.key
        );
        for dimension in definition.key.dimensions() {
            let value = subject
                .value(*dimension)
                .ok_or(KeyError::MissingDimension(*dimension))?;
            key.push(':');
            key.push_str(&escape(value));
        }
        Ok(key)
    }
}

fn escape(value: &str) -> String {
    value.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ratelimit::types::LimitScope;
    use std::time::Duration;

    fn definition(name: &str, template: &str) -> LimitDefinition {
        LimitDefinition::new(name, template.parse().unwrap(), 10, Duration::from_secs(60))
    }

    fn subject() -> RateLimitSubject {
        RateLimitSubject {
            client_ip: Some("203.0.113.7".into()),
            user_id: Some("u1".into()),
            route: Some("/api/orders".into()),
        }
    }

    #[test]
    fn test_template_parse_and_display() {
        let template: KeyTemplate = "User: Route".parse().unwrap();
        assert_eq!(template.dimensions(), &[Dimension::User, Dimension::Route]);
        assert_eq!(template.to_string(), "user:route");
    }

    #[test]
    fn test_template_rejects_unknown_and_duplicate_dimensions() {
        assert!("tenant".parse::<KeyTemplate>().is_err());
        assert!("ip:ip".parse::<KeyTemplate>().is_err());
        assert!("".parse::<KeyTemplate>().is_err());
    }

    #[test]
    fn test_composite_key_is_deterministic() {
        let generator = KeyGenerator::new("rl");
        let def = definition("per-user-route", "user:route");

        let first = generator.generate(&def, &subject()).unwrap();
        let second = generator.generate(&def, &subject()).unwrap();

        assert_eq!(first, "rl:route:per-user-route:user:route:u1:/api/orders");
        assert_eq!(first, second);
    }

    #[test]
    fn test_different_routes_produce_different_keys() {
        let generator = KeyGenerator::new("rl");
        let def = definition("per-user-route", "user:route");

        let mut other = subject();
        other.route = Some("/api/invoices".into());

        assert_ne!(
            generator.generate(&def, &subject()).unwrap(),
            generator.generate(&def, &other).unwrap()
        );
    }

    #[test]
    fn test_same_name_in_different_scopes_gets_separate_keys() {
        let generator = KeyGenerator::new("rl");
        let global = definition("per-ip", "ip").with_scope(LimitScope::Global);
        let route = definition("per-ip", "ip");

        let global_key = generator.generate(&global, &subject()).unwrap();
        let route_key = generator.generate(&route, &subject()).unwrap();
        assert_eq!(global_key, "rl:global:per-ip:ip:203.0.113.7");
        assert_ne!(global_key, route_key);
    }

    #[test]
    fn test_missing_dimension_is_reported() {
        let generator = KeyGenerator::new("rl");
        let def = definition("per-user", "user");
        let anonymous = RateLimitSubject {
            user_id: None,
            ..subject()
        };

        assert_eq!(
            generator.generate(&def, &anonymous),
            Err(KeyError::MissingDimension(Dimension::User))
        );
    }

    #[test]
    fn test_colons_in_values_cannot_collide() {
        let generator = KeyGenerator::new("rl");
        let def = definition("pair", "user:route");

        let a = RateLimitSubject {
            user_id: Some("a:b".into()),
            route: Some("/c".into()),
            ..Default::default()
        };
        let b = RateLimitSubject {
            user_id: Some("a".into()),
            route: Some("b:/c".into()),
            ..Default::default()
        };

        assert_ne!(
            generator.generate(&def, &a).unwrap(),
            generator.generate(&def, &b).unwrap()
        );
    }

    #[test]
    fn test_ipv6_address_is_escaped() {
        let generator = KeyGenerator::new("rl");
        let def = definition("per-ip", "ip");
        let v6 = RateLimitSubject {
            client_ip: Some("2001:db8::1".into()),
            ..Default::default()
        };

        assert_eq!(
            generator.generate(&def, &v6).unwrap(),
            "rl:route:per-ip:ip:2001%3Adb8%3A%3A1"
        );
    }
}
