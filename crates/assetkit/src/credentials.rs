//! Credential resolution at apply time
//!
//! Bundles only ever hold [`SECRET_MASK`] in secret fields. When an entity
//! is about to be applied, each masked field is filled from, in order:
//!
//! 1. the override map (batch mode, `--secret key=value`)
//! 2. the [`CredentialSource`] collaborator
//! 3. the operator, through a [`SecretPrompt`], when running interactively
//!
//! A candidate value is accepted only once the optional
//! [`ConnectionVerifier`] agrees it works.

use crate::entity::{Entity, EntityKind, SECRET_MASK};
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A secret value that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext, for handing to the target store only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Logical key of a secret field: `<kind>/<uuid>/<field>`
pub fn logical_key(kind: EntityKind, uuid: Uuid, field: &str) -> String {
    format!("{kind}/{uuid}/{field}")
}

/// Name-based alias of a logical key: `<kind>/<name>/<field>`
pub fn name_key(kind: EntityKind, name: &str, field: &str) -> String {
    format!("{kind}/{name}/{field}")
}

/// Where secrets come from when no override was given.
pub trait CredentialSource: Send + Sync {
    fn lookup(&self, key: &str) -> Option<Secret>;
}

/// Interactive operator input.
pub trait SecretPrompt: Send + Sync {
    /// Ask for the value of `field` on `entity`; `attempt` starts at 1
    fn prompt(&self, entity: &Entity, field: &str, attempt: u32) -> Option<Secret>;
}

/// Checks that a candidate secret actually works before it is accepted.
///
/// For connections this is a handshake against the described endpoint.
pub trait ConnectionVerifier: Send + Sync {
    fn verify(&self, entity: &Entity, field: &str, secret: &Secret)
    -> std::result::Result<(), String>;
}

/// Credential source backed by a map, mostly for tests and batch files.
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    secrets: HashMap<String, Secret>,
}

impl StaticSource {
    pub fn new(secrets: impl IntoIterator<Item = (String, Secret)>) -> Self {
        Self {
            secrets: secrets.into_iter().collect(),
        }
    }
}

impl CredentialSource for StaticSource {
    fn lookup(&self, key: &str) -> Option<Secret> {
        self.secrets.get(key).cloned()
    }
}

/// Fills masked secret fields of an entity.
pub struct CredentialResolver<'a> {
    overrides: HashMap<String, Secret>,
    source: Option<&'a dyn CredentialSource>,
    prompt: Option<&'a dyn SecretPrompt>,
    verifier: Option<&'a dyn ConnectionVerifier>,
    max_prompts: u32,
}

impl Default for CredentialResolver<'_> {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            source: None,
            prompt: None,
            verifier: None,
            max_prompts: 3,
        }
    }
}

impl<'a> CredentialResolver<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides keyed by logical key or name key
    pub fn with_overrides(mut self, overrides: HashMap<String, Secret>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_source(mut self, source: &'a dyn CredentialSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Enable interactive prompting as the last resort
    pub fn interactive(mut self, prompt: &'a dyn SecretPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_verifier(mut self, verifier: &'a dyn ConnectionVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.prompt.is_some()
    }

    /// Fill every secret field of `entity` that still holds the mask.
    pub fn resolve(&self, mut entity: Entity) -> Result<Entity> {
        for field in entity.masked_secret_fields() {
            let secret = self.resolve_field(&entity, field)?;
            entity
                .payload
                .insert(field.to_string(), Value::String(secret.expose().to_string()));
        }
        Ok(entity)
    }

    fn resolve_field(&self, entity: &Entity, field: &str) -> Result<Secret> {
        let key = logical_key(entity.kind, entity.uuid, field);
        let alias = name_key(entity.kind, &entity.name, field);
        let mut rejections = Vec::new();

        let from_overrides = self
            .overrides
            .get(&key)
            .or_else(|| self.overrides.get(&alias))
            .cloned();
        if let Some(secret) = from_overrides {
            match self.check(entity, field, &secret) {
                Ok(()) => {
                    log::debug!("secret {key} resolved from overrides");
                    return Ok(secret);
                }
                Err(reason) => rejections.push(format!("override rejected: {reason}")),
            }
        }

        if let Some(secret) = self.source.and_then(|s| s.lookup(&key)) {
            match self.check(entity, field, &secret) {
                Ok(()) => {
                    log::debug!("secret {key} resolved from credential source");
                    return Ok(secret);
                }
                Err(reason) => rejections.push(format!("credential source value rejected: {reason}")),
            }
        }

        if let Some(prompt) = self.prompt {
            for attempt in 1..=self.max_prompts {
                let Some(secret) = prompt.prompt(entity, field, attempt) else {
                    break;
                };
                match self.check(entity, field, &secret) {
                    Ok(()) => return Ok(secret),
                    Err(reason) => {
                        log::warn!("{key}: attempt {attempt} rejected: {reason}");
                        rejections.push(format!("prompt attempt {attempt} rejected: {reason}"));
                    }
                }
            }
        }

        let reason = if rejections.is_empty() {
            if self.is_interactive() {
                "no value supplied".to_string()
            } else {
                format!("no override or stored value for {key} (non-interactive)")
            }
        } else {
            rejections.join("; ")
        };
        Err(Error::CredentialUnresolved {
            uuid: entity.uuid,
            field: field.to_string(),
            reason,
        })
    }

    fn check(&self, entity: &Entity, field: &str, secret: &Secret) -> std::result::Result<(), String> {
        if secret.expose() == SECRET_MASK {
            return Err("value is the masking sentinel".to_string());
        }
        match self.verifier {
            Some(verifier) => verifier.verify(entity, field, secret),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn masked_connection() -> Entity {
        let payload = json!({ "uri": "postgresql://etl@db:5432/warehouse", "password": SECRET_MASK });
        Entity::new(
            EntityKind::Connection,
            "warehouse",
            payload.as_object().cloned().unwrap_or_default(),
        )
    }

    struct FixedPrompt {
        answers: Vec<&'static str>,
        calls: AtomicU32,
    }

    impl SecretPrompt for FixedPrompt {
        fn prompt(&self, _: &Entity, _: &str, attempt: u32) -> Option<Secret> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(attempt as usize - 1)
                .map(|s| Secret::from(*s))
        }
    }

    struct AcceptOnly(&'static str);

    impl ConnectionVerifier for AcceptOnly {
        fn verify(&self, _: &Entity, _: &str, secret: &Secret) -> std::result::Result<(), String> {
            if secret.expose() == self.0 {
                Ok(())
            } else {
                Err("authentication failed".to_string())
            }
        }
    }

    #[test]
    fn test_override_by_logical_key() {
        let entity = masked_connection();
        let key = logical_key(entity.kind, entity.uuid, "password");
        let resolver =
            CredentialResolver::new().with_overrides(HashMap::from([(key, Secret::from("s3cret"))]));
        let resolved = resolver.resolve(entity).unwrap();
        assert_eq!(resolved.payload["password"], json!("s3cret"));
    }

    #[test]
    fn test_override_by_name() {
        let entity = masked_connection();
        let resolver = CredentialResolver::new().with_overrides(HashMap::from([(
            "connection/warehouse/password".to_string(),
            Secret::from("by-name"),
        )]));
        let resolved = resolver.resolve(entity).unwrap();
        assert_eq!(resolved.payload["password"], json!("by-name"));
    }

    #[test]
    fn test_source_used_after_overrides() {
        let entity = masked_connection();
        let key = logical_key(entity.kind, entity.uuid, "password");
        let source = StaticSource::new([(key, Secret::from("from-vault"))]);
        let resolver = CredentialResolver::new().with_source(&source);
        let resolved = resolver.resolve(entity).unwrap();
        assert_eq!(resolved.payload["password"], json!("from-vault"));
    }

    #[test]
    fn test_prompt_only_when_interactive() {
        let entity = masked_connection();
        let err = CredentialResolver::new().resolve(entity.clone()).unwrap_err();
        assert!(matches!(err, Error::CredentialUnresolved { .. }));

        let prompt = FixedPrompt {
            answers: vec!["typed"],
            calls: AtomicU32::new(0),
        };
        let resolved = CredentialResolver::new()
            .interactive(&prompt)
            .resolve(entity)
            .unwrap();
        assert_eq!(resolved.payload["password"], json!("typed"));
    }

    #[test]
    fn test_verifier_rejection_falls_through_to_prompt() {
        let entity = masked_connection();
        let key = logical_key(entity.kind, entity.uuid, "password");
        let source = StaticSource::new([(key, Secret::from("stale"))]);
        let prompt = FixedPrompt {
            answers: vec!["wrong", "right"],
            calls: AtomicU32::new(0),
        };
        let verifier = AcceptOnly("right");
        let resolved = CredentialResolver::new()
            .with_source(&source)
            .interactive(&prompt)
            .with_verifier(&verifier)
            .resolve(entity)
            .unwrap();
        assert_eq!(resolved.payload["password"], json!("right"));
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unresolved_reason_never_contains_secret() {
        let entity = masked_connection();
        let key = logical_key(entity.kind, entity.uuid, "password");
        let verifier = AcceptOnly("right");
        let err = CredentialResolver::new()
            .with_overrides(HashMap::from([(key, Secret::from("topsecret"))]))
            .with_verifier(&verifier)
            .resolve(entity)
            .unwrap_err();
        assert!(!err.to_string().contains("topsecret"));
    }

    #[test]
    fn test_unmasked_fields_untouched() {
        let mut entity = masked_connection();
        entity
            .payload
            .insert("password".into(), json!("already-real"));
        let resolved = CredentialResolver::new().resolve(entity).unwrap();
        assert_eq!(resolved.payload["password"], json!("already-real"));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        assert_eq!(format!("{:?}", Secret::from("hunter2")), "Secret(***)");
    }
}
