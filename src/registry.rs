//! Engine registration and the capability cache.
//!
//! Engines are listed in an [`EngineRegistry`] (a plain registration table),
//! then probed exactly once by [`CapabilityRegistry::probe_all`]. After that,
//! the capability cache never changes, so lookups need no locking. A broken
//! engine never stops the service from starting. It just shows up as
//! unavailable.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;

use crate::{
    engines::{EngineDescriptor, OcrEngine},
    error::CapabilityError,
    prelude::*,
};

/// An operating system an engine can be restricted to.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other(String),
}

impl Platform {
    /// The platform we're running on.
    pub fn current() -> Self {
        std::env::consts::OS
            .parse()
            .unwrap_or_else(|_| Platform::Other(std::env::consts::OS.to_owned()))
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" => Err(anyhow!("empty platform name")),
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" => Ok(Platform::MacOs),
            "windows" | "win32" => Ok(Platform::Windows),
            other => Ok(Platform::Other(other.to_owned())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::MacOs => write!(f, "macos"),
            Platform::Windows => write!(f, "windows"),
            Platform::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Runtime facts about an engine, probed once at startup.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineCapabilities {
    /// Can we use this engine?
    pub available: bool,

    /// Engine version, if known.
    pub version: Option<String>,

    /// Supported language codes. Always empty when `available` is false.
    pub supported_languages: BTreeSet<String>,

    /// When we probed.
    pub last_probed_at: DateTime<Utc>,

    /// Why the engine is unavailable, if it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
}

impl EngineCapabilities {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            version: None,
            supported_languages: BTreeSet::new(),
            last_probed_at: Utc::now(),
            unavailable_reason: Some(reason.into()),
        }
    }
}

/// Engine summary, as returned by `list_engines`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineSummary {
    pub name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub supported_languages: Vec<String>,
    pub supports_gpu: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_requirement: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
}

/// A table of engines waiting to be probed.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn OcrEngine>>,
    field_owners: HashMap<&'static str, &'static str>,
}

impl EngineRegistry {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine. Fails if the name is taken, or if any of its
    /// parameter names are already declared by another engine.
    pub fn register(&mut self, engine: Arc<dyn OcrEngine>) -> Result<()> {
        let name = engine.descriptor().name;
        let fields = engine.descriptor().config_schema.fields;
        if self.engines.iter().any(|e| e.descriptor().name == name) {
            return Err(anyhow!("engine {name:?} is already registered"));
        }
        for field in fields {
            if let Some(owner) = self.field_owners.get(field.name) {
                return Err(anyhow!(
                    "engine {name:?} declares parameter {:?}, which already belongs to engine {owner:?}",
                    field.name,
                ));
            }
        }
        for field in fields {
            self.field_owners.insert(field.name, name);
        }
        self.engines.push(engine);
        Ok(())
    }

    /// Register several engines.
    pub fn with_engines(
        engines: impl IntoIterator<Item = Arc<dyn OcrEngine>>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for engine in engines {
            registry.register(engine)?;
        }
        Ok(registry)
    }
}

/// A registered engine and its probed capabilities.
struct RegisteredEngine {
    engine: Arc<dyn OcrEngine>,
    capabilities: EngineCapabilities,
}

/// Cached engine capabilities. Read-only once built.
pub struct CapabilityRegistry {
    engines: BTreeMap<&'static str, RegisteredEngine>,
    field_owners: HashMap<&'static str, &'static str>,
    platform: Platform,
}

impl CapabilityRegistry {
    /// Probe every registered engine, concurrently, on the current platform.
    pub async fn probe_all(table: EngineRegistry, probe_timeout: Duration) -> Self {
        Self::probe_all_on(table, Platform::current(), probe_timeout).await
    }

    /// Probe every registered engine as if running on `platform`.
    ///
    /// This never fails. Any engine whose probe fails, hangs past
    /// `probe_timeout`, or that can't run on `platform` is marked unavailable.
    #[instrument(level = "debug", skip(table))]
    pub async fn probe_all_on(
        table: EngineRegistry,
        platform: Platform,
        probe_timeout: Duration,
    ) -> Self {
        let EngineRegistry {
            engines,
            field_owners,
        } = table;
        let probes = engines.into_iter().map(|engine| {
            let platform = platform.clone();
            async move {
                let capabilities = probe_engine(&*engine, &platform, probe_timeout).await;
                (engine, capabilities)
            }
        });
        let engines = join_all(probes)
            .await
            .into_iter()
            .map(|(engine, capabilities)| {
                (
                    engine.descriptor().name,
                    RegisteredEngine {
                        engine,
                        capabilities,
                    },
                )
            })
            .collect();
        Self {
            engines,
            field_owners,
            platform,
        }
    }

    /// The platform we probed for.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Is `engine_name` registered and usable?
    pub fn is_available(&self, engine_name: &str) -> bool {
        self.engines
            .get(engine_name)
            .is_some_and(|e| e.capabilities.available)
    }

    /// Probed capabilities of an engine.
    pub fn capabilities_of(
        &self,
        engine_name: &str,
    ) -> Result<&EngineCapabilities, CapabilityError> {
        Ok(&self.lookup(engine_name)?.capabilities)
    }

    /// Static descriptor of an engine.
    pub fn descriptor(&self, engine_name: &str) -> Result<&EngineDescriptor, CapabilityError> {
        Ok(self.lookup(engine_name)?.engine.descriptor())
    }

    /// The engine itself.
    pub fn engine(&self, engine_name: &str) -> Result<Arc<dyn OcrEngine>, CapabilityError> {
        Ok(self.lookup(engine_name)?.engine.clone())
    }

    /// Which engine declares a parameter with this name?
    pub fn owner_of_field(&self, field: &str) -> Option<&'static str> {
        self.field_owners.get(field).copied()
    }

    /// Check that an engine can run on this platform, and is available.
    pub fn validate_platform(&self, engine_name: &str) -> Result<(), CapabilityError> {
        let registered = self.lookup(engine_name)?;
        if let Some(required) = &registered.engine.descriptor().platform_requirement {
            if *required != self.platform {
                return Err(CapabilityError::IncompatiblePlatform {
                    engine: engine_name.to_owned(),
                    required: required.to_string(),
                    actual: self.platform.to_string(),
                });
            }
        }
        self.check_available(engine_name, registered)
    }

    /// Check that an engine supports every one of `codes`. Reports all the
    /// unsupported codes, not just the first.
    pub fn validate_languages<S: AsRef<str>>(
        &self,
        engine_name: &str,
        codes: &[S],
    ) -> Result<(), CapabilityError> {
        let registered = self.lookup(engine_name)?;
        self.check_available(engine_name, registered)?;
        let unsupported = codes
            .iter()
            .map(AsRef::as_ref)
            .filter(|code| !registered.capabilities.supported_languages.contains(*code))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(CapabilityError::UnsupportedLanguage {
                engine: engine_name.to_owned(),
                codes: unsupported,
            })
        }
    }

    /// Summaries of all registered engines, sorted by name.
    pub fn list_engines(&self) -> Vec<EngineSummary> {
        self.engines
            .values()
            .map(|registered| {
                let descriptor = registered.engine.descriptor();
                let caps = &registered.capabilities;
                EngineSummary {
                    name: descriptor.name.to_owned(),
                    available: caps.available,
                    version: caps.version.clone(),
                    supported_languages: caps.supported_languages.iter().cloned().collect(),
                    supports_gpu: descriptor.supports_gpu,
                    platform_requirement: descriptor.platform_requirement.clone(),
                    unavailable_reason: caps.unavailable_reason.clone(),
                }
            })
            .collect()
    }

    fn lookup(&self, engine_name: &str) -> Result<&RegisteredEngine, CapabilityError> {
        self.engines
            .get(engine_name)
            .ok_or_else(|| CapabilityError::UnknownEngine(engine_name.to_owned()))
    }

    fn check_available(
        &self,
        engine_name: &str,
        registered: &RegisteredEngine,
    ) -> Result<(), CapabilityError> {
        if registered.capabilities.available {
            Ok(())
        } else {
            Err(CapabilityError::Unavailable {
                engine: engine_name.to_owned(),
                reason: registered.capabilities.unavailable_reason.clone(),
            })
        }
    }
}

/// Probe a single engine. Never fails; problems become "unavailable".
#[instrument(level = "debug", skip_all, fields(engine = engine.descriptor().name))]
async fn probe_engine(
    engine: &dyn OcrEngine,
    platform: &Platform,
    probe_timeout: Duration,
) -> EngineCapabilities {
    let name = engine.descriptor().name;
    if let Some(required) = &engine.descriptor().platform_requirement {
        if required != platform {
            warn!(
                engine = name,
                %required,
                %platform,
                "Engine is not supported on this platform"
            );
            return EngineCapabilities::unavailable(format!(
                "requires platform {required}"
            ));
        }
    }

    let probe = async {
        if !engine.is_installed().await? {
            return Ok(None);
        }
        engine.capabilities().await.map(Some)
    };
    match tokio::time::timeout(probe_timeout, probe).await {
        Ok(Ok(Some(probed))) => {
            info!(
                engine = name,
                version = probed.version.as_deref().unwrap_or("unknown"),
                language_count = probed.languages.len(),
                "Engine is available"
            );
            EngineCapabilities {
                available: true,
                version: probed.version,
                supported_languages: probed.languages,
                last_probed_at: Utc::now(),
                unavailable_reason: None,
            }
        }
        Ok(Ok(None)) => {
            warn!(engine = name, "Engine is not installed");
            EngineCapabilities::unavailable("not installed")
        }
        Ok(Err(err)) => {
            warn!(engine = name, "Engine probe failed: {err:?}");
            EngineCapabilities::unavailable(format!("probe failed: {err}"))
        }
        Err(_) => {
            warn!(
                engine = name,
                "Engine probe did not finish within {probe_timeout:?}"
            );
            EngineCapabilities::unavailable("probe timed out")
        }
    }
}
