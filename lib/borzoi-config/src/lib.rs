//! Primitives for loading and querying typed and untyped configuration data.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use borzoi_error::GenericError;
use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
///
/// Configuration errors are fatal: they are only ever surfaced while building a pipeline, before any records have been
/// accepted, and callers are expected to abort startup when they see one.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Guidance on how the missing field can be supplied.
        ///
        /// Meant for display to an operator. When environment variables were among the loaded sources, this names the
        /// variable that would satisfy the lookup.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field could not be deserialized as the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path of the offending field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum KeySource {
    /// Keys were loaded from environment variables under the given prefix.
    Environment { prefix: String },
}

impl KeySource {
    /// Renders a `a.b.c`-style key the way this source would have spelled it.
    fn render_key(&self, key: &str) -> String {
        match self {
            // The prefix is stored uppercased with its trailing underscore, so only the key itself needs mapping.
            KeySource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "_").to_uppercase()),
        }
    }
}

struct ErasedProvider(Box<dyn figment::Provider + Send + Sync>);

impl figment::Provider for ErasedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// Wraps `figment` behind a smaller API focused on the two things the pipeline needs: stacking configuration sources
/// and extracting values out of the stack. Sources added later take precedence over sources added earlier, so a
/// typical arrangement is defaults first, then a configuration file, then environment variables on top.
///
/// Once every source is added, the loader is consumed either into a single typed value
/// ([`into_typed`][Self::into_typed]) or into a [`GenericConfiguration`] for key-by-key querying
/// ([`into_generic`][Self::into_generic]).
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    key_sources: HashSet<KeySource>,
    providers: Vec<ErasedProvider>,
}

impl ConfigurationLoader {
    fn push_provider<P>(&mut self, provider: P)
    where
        P: figment::Provider + Send + Sync + 'static,
    {
        self.providers.push(ErasedProvider(Box::new(provider)));
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = ResolvedProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        self.push_provider(provider);
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(provider) => self.push_provider(provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid JSON, an error will be returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = ResolvedProvider::from_json(&path).map_err(GenericError::from).context(Generic)?;
        self.push_provider(provider);
        Ok(self)
    }

    /// Attempts to load the given JSON configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid JSON.
    pub fn try_from_json<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match ResolvedProvider::from_json(&path) {
            Ok(provider) => self.push_provider(provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read JSON configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Only variables starting with the given prefix are considered, and the prefix is stripped before the remainder
    /// becomes a configuration key. An underscore is appended to the prefix if it does not already end with one, so a
    /// prefix of `app` matches variables named `app_*`. Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        // `Env` isn't `Send + Sync`, so we snapshot its values into a `Serialized` provider instead of holding on to
        // the provider itself.
        let env = Env::prefixed(&prefix);
        let values = env.data().unwrap();
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.push_provider(Serialized::defaults(default_dict.clone()));
            self.key_sources.insert(KeySource::Environment { prefix });
        }
        Ok(self)
    }

    fn merged(self) -> (Figment, HashSet<KeySource>) {
        let merged = self
            .providers
            .into_iter()
            .fold(Figment::new(), |stack, provider| stack.admerge(provider));
        (merged, self.key_sources)
    }

    /// Consumes the configuration loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let (merged, _) = self.merged();
        merged.extract().map_err(Into::into)
    }

    /// Consumes the configuration loader and wraps the merged configuration in a generic wrapper.
    pub fn into_generic(self) -> Result<GenericConfiguration, ConfigurationError> {
        let (merged, key_sources) = self.merged();
        Ok(GenericConfiguration {
            shared: Arc::new(Shared {
                merged,
                key_sources,
            }),
        })
    }
}

#[derive(Debug)]
struct Shared {
    merged: Figment,
    key_sources: HashSet<KeySource>,
}

/// A generic configuration object.
///
/// The merged view over everything a [`ConfigurationLoader`] loaded, queryable key by key. Keys use periods for
/// nesting: with a YAML source of
///
/// ```yaml
/// cache:
///   capacity: 4096
/// ```
///
/// the key `cache.capacity` yields `4096`, and `cache` yields the nested mapping. Cloning is cheap; clones share the
/// underlying data.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    shared: Arc<Shared>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.shared.merged.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e.kind, Kind::MissingField(_)) {
                    // A nested key such as `cache.capacity` may only exist in its flat environment-variable spelling,
                    // since environment variables carry no nesting. Retry with the separators flattened to match.
                    let flattened = key.replace('.', "_");
                    self.shared
                        .merged
                        .extract_inner(&flattened)
                        .map_err(|flat_e| describe_figment_error(&self.shared.key_sources, flat_e))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Gets a configuration value by key.
    ///
    /// The key must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested lookup.
    ///
    /// # Errors
    ///
    /// If the key does not exist in the configuration, or if the value could not be deserialized into `T`, an error
    /// variant will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value if the key does not exist or could not be deserialized.
    ///
    /// Swallows every error, including deserialization errors, so it should be reserved for values where silently
    /// falling back to `T::default()` is acceptable.
    ///
    /// The key must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested lookup.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// If the key exists in the configuration, and can be deserialized, `Ok(Some(value))` is returned. Otherwise,
    /// `Ok(None)` will be returned.
    ///
    /// The key must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested lookup.
    ///
    /// # Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.shared
            .merged
            .extract()
            .map_err(|e| describe_figment_error(&self.shared.key_sources, e))
    }
}

/// Converts a figment error into a `ConfigurationError`, spelling out for missing fields every form the key could
/// have been supplied in.
fn describe_figment_error(key_sources: &HashSet<KeySource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut candidates = vec![field.to_string()];
            candidates.extend(key_sources.iter().map(|source| source.render_key(&field)));

            let help_text = format!("Try setting `{}`.", candidates.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
