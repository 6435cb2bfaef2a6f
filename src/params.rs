//! Per-engine parameter schemas and validation.
//!
//! Each engine declares a static [`ConfigSchema`] listing the parameters it
//! accepts. Raw request parameters are checked against that schema, coerced
//! into JSON of the right shape, and then deserialized into the engine's typed
//! config struct. Parameters declared by one engine are never accepted by
//! another.

use std::sync::Arc;

use crate::{
    engines::{
        easyocr::EasyOcrConfig, pdftotext::PdfToTextConfig, tesseract::TesseractConfig,
    },
    error::{FieldViolation, SubmitError, ValidationError},
    prelude::*,
    registry::CapabilityRegistry,
};

/// Untyped request parameters.
pub type RawParams = serde_json::Map<String, Value>;

/// The most languages a single request may ask for.
pub const MAX_LANGUAGES: usize = 5;

/// What kind of value a parameter holds, and its constraints.
#[derive(Clone, Copy, Debug)]
pub enum FieldKind {
    /// An integer in `min..=max`.
    Integer { min: i64, max: i64 },
    /// A number in `min..=max`.
    Number { min: f64, max: f64 },
    Bool,
    /// One of a fixed set of strings.
    Choice(&'static [&'static str]),
    /// A list of `1..=max` language codes.
    Languages { max: usize },
}

/// A single declared parameter.
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Check a raw value, and convert it to the JSON shape the config struct
    /// expects. Strings are accepted for scalar fields, because query strings
    /// and command lines only have strings.
    fn coerce(&self, value: &Value) -> Result<Value, FieldViolation> {
        let violation = |message: String| FieldViolation::new(self.name, message);
        match self.kind {
            FieldKind::Integer { min, max } => {
                let n = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| violation(format!("expected an integer, found {value}")))?;
                if n < min || n > max {
                    return Err(violation(if max == i64::MAX {
                        format!("must be at least {min}, found {n}")
                    } else {
                        format!("must be between {min} and {max}, found {n}")
                    }));
                }
                Ok(json!(n))
            }
            FieldKind::Number { min, max } => {
                let n = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .filter(|n| n.is_finite())
                .ok_or_else(|| violation(format!("expected a number, found {value}")))?;
                if n < min || n > max {
                    return Err(violation(format!(
                        "must be between {min} and {max}, found {n}"
                    )));
                }
                Ok(json!(n))
            }
            FieldKind::Bool => match value {
                Value::Bool(b) => Ok(json!(b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(json!(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(json!(false)),
                _ => Err(violation(format!("expected true or false, found {value}"))),
            },
            FieldKind::Choice(choices) => match value {
                Value::String(s) if choices.contains(&s.as_str()) => Ok(json!(s)),
                _ => Err(violation(format!(
                    "must be one of {}, found {value}",
                    choices.join(", ")
                ))),
            },
            FieldKind::Languages { max } => {
                let codes = match value {
                    Value::String(s) => split_language_list(s),
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => Ok(s.trim().to_owned()),
                            other => Err(violation(format!(
                                "expected language codes, found {other}"
                            ))),
                        })
                        .collect::<Result<Vec<_>, _>>()?
                        .into_iter()
                        .filter(|s| !s.is_empty())
                        .collect(),
                    _ => {
                        return Err(violation(format!(
                            "expected a list of language codes, found {value}"
                        )));
                    }
                };
                if codes.is_empty() {
                    return Err(violation("must list at least one language".to_owned()));
                }
                if codes.len() > max {
                    return Err(violation(format!(
                        "may list at most {max} languages, found {}",
                        codes.len()
                    )));
                }
                Ok(json!(codes))
            }
        }
    }
}

/// Split `"eng+fra"` or `"en,fr"` into codes.
fn split_language_list(s: &str) -> Vec<String> {
    s.split(['+', ','])
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_owned)
        .collect()
}

/// The parameters an engine accepts, and how to build its typed config.
#[derive(Debug)]
pub struct ConfigSchema {
    pub fields: &'static [FieldSpec],

    /// Deserialize already-checked parameters. Missing fields take defaults.
    pub build: fn(Value) -> serde_json::Result<EngineConfig>,
}

impl ConfigSchema {
    /// Look up a declared field.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A validated, typed parameter set for exactly one engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "engine")]
pub enum EngineConfig {
    #[serde(rename = "tesseract")]
    Tesseract(TesseractConfig),
    #[serde(rename = "easyocr")]
    EasyOcr(EasyOcrConfig),
    #[serde(rename = "pdftotext")]
    PdfToText(PdfToTextConfig),
}

impl EngineConfig {
    /// Does this config ask to run on a GPU?
    pub fn requests_gpu(&self) -> bool {
        match self {
            EngineConfig::EasyOcr(config) => config.gpu,
            EngineConfig::Tesseract(_) | EngineConfig::PdfToText(_) => false,
        }
    }

    /// Requested language codes, if the engine takes any.
    pub fn languages(&self) -> &[String] {
        match self {
            EngineConfig::Tesseract(config) => &config.lang,
            EngineConfig::EasyOcr(config) => &config.languages,
            EngineConfig::PdfToText(_) => &[],
        }
    }

    /// Constraints that involve more than one field.
    pub fn violations(&self) -> Vec<FieldViolation> {
        match self {
            EngineConfig::PdfToText(PdfToTextConfig {
                first_page: Some(first),
                last_page: Some(last),
                ..
            }) if last < first => vec![FieldViolation::new(
                "last_page",
                format!("must not be before first_page ({first}), found {last}"),
            )],
            _ => vec![],
        }
    }
}

/// Turns raw request parameters into an [`EngineConfig`].
#[derive(Clone)]
pub struct ParameterValidator {
    registry: Arc<CapabilityRegistry>,
}

impl ParameterValidator {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Validate `raw` for `engine`.
    ///
    /// Checks run in this order, and the first failing stage wins:
    ///
    /// 1. Any parameter `engine` doesn't declare is rejected immediately.
    /// 2. Every remaining parameter is checked, and all problems are reported
    ///    together.
    /// 3. The engine must be available on this platform.
    /// 4. Every requested language must be supported.
    #[instrument(level = "debug", skip(self, raw))]
    pub fn parse(
        &self,
        engine: Option<&str>,
        raw: &RawParams,
    ) -> Result<EngineConfig, SubmitError> {
        let engine = engine
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(ValidationError::MissingEngine)?;
        let schema = self.registry.descriptor(engine)?.config_schema;

        if let Some(field) = raw.keys().find(|field| schema.field(field).is_none()) {
            return Err(ValidationError::ForeignField {
                field: field.clone(),
                engine: engine.to_owned(),
                owner: self.registry.owner_of_field(field).map(str::to_owned),
            }
            .into());
        }

        let mut checked = RawParams::new();
        let mut violations = vec![];
        for (name, value) in raw {
            // Explicit nulls mean "use the default".
            if value.is_null() {
                continue;
            }
            let Some(spec) = schema.field(name) else {
                continue;
            };
            match spec.coerce(value) {
                Ok(value) => {
                    checked.insert(name.clone(), value);
                }
                Err(violation) => violations.push(violation),
            }
        }
        if !violations.is_empty() {
            return Err(ValidationError::InvalidFields(violations).into());
        }

        let config = (schema.build)(Value::Object(checked)).map_err(|err| {
            ValidationError::InvalidFields(vec![FieldViolation::new(
                "params",
                err.to_string(),
            )])
        })?;
        let violations = config.violations();
        if !violations.is_empty() {
            return Err(ValidationError::InvalidFields(violations).into());
        }

        self.registry.validate_platform(engine)?;
        self.registry.validate_languages(engine, config.languages())?;
        debug!(engine, ?config, "Validated parameters");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        engines::{
            EngineDescriptor, EngineError, OcrEngine, ProbedCapabilities, RawResult,
            easyocr, pdftotext, tesseract,
        },
        error::AvailabilityError,
        registry::{EngineRegistry, Platform},
    };

    struct FakeEngine {
        descriptor: EngineDescriptor,
        installed: bool,
        languages: &'static [&'static str],
    }

    #[async_trait]
    impl OcrEngine for FakeEngine {
        fn descriptor(&self) -> &EngineDescriptor {
            &self.descriptor
        }

        async fn is_installed(&self) -> Result<bool> {
            Ok(self.installed)
        }

        async fn capabilities(&self) -> Result<ProbedCapabilities> {
            Ok(ProbedCapabilities {
                version: None,
                languages: self.languages.iter().map(|s| s.to_string()).collect(),
            })
        }

        async fn process(
            &self,
            _input: &Path,
            _config: &EngineConfig,
        ) -> Result<RawResult, EngineError> {
            Ok(RawResult::default())
        }
    }

    fn fake(
        name: &'static str,
        schema: &'static ConfigSchema,
        installed: bool,
        languages: &'static [&'static str],
    ) -> Arc<dyn OcrEngine> {
        Arc::new(FakeEngine {
            descriptor: EngineDescriptor {
                name,
                platform_requirement: None,
                supports_gpu: name == "easyocr",
                config_schema: schema,
            },
            installed,
            languages,
        })
    }

    async fn validator(easyocr_installed: bool) -> ParameterValidator {
        let table = EngineRegistry::with_engines([
            fake("tesseract", &tesseract::CONFIG_SCHEMA, true, &["eng", "fra", "deu"]),
            fake("easyocr", &easyocr::CONFIG_SCHEMA, easyocr_installed, &["en", "fr"]),
            fake("pdftotext", &pdftotext::CONFIG_SCHEMA, true, &[]),
        ])
        .unwrap();
        let registry =
            CapabilityRegistry::probe_all_on(table, Platform::Linux, Duration::from_secs(5))
                .await;
        ParameterValidator::new(Arc::new(registry))
    }

    fn params(value: Value) -> RawParams {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_defaults_fill_missing_fields() {
        let validator = validator(true).await;
        let config = validator.parse(Some("tesseract"), &RawParams::new()).unwrap();
        assert_eq!(config, EngineConfig::Tesseract(TesseractConfig::default()));
        assert_eq!(config.languages(), ["eng"]);
        assert!(!config.requests_gpu());
    }

    #[tokio::test]
    async fn test_languages_accept_strings_and_arrays() {
        let validator = validator(true).await;
        let from_string = validator
            .parse(Some("tesseract"), &params(json!({ "lang": "eng+fra" })))
            .unwrap();
        let from_array = validator
            .parse(Some("tesseract"), &params(json!({ "lang": ["eng", "fra"] })))
            .unwrap();
        assert_eq!(from_string, from_array);
        assert_eq!(from_string.languages(), ["eng", "fra"]);
    }

    #[tokio::test]
    async fn test_foreign_field_names_its_owner() {
        let validator = validator(true).await;
        let err = validator
            .parse(
                Some("easyocr"),
                // Also has a bad value, but the foreign field is fatal first.
                &params(json!({ "psm": 6, "text_threshold": 7 })),
            )
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::Validation(ValidationError::ForeignField {
                field: "psm".to_owned(),
                engine: "easyocr".to_owned(),
                owner: Some("tesseract".to_owned()),
            })
        );
    }

    #[tokio::test]
    async fn test_field_nobody_declares() {
        let validator = validator(true).await;
        let err = validator
            .parse(Some("tesseract"), &params(json!({ "colour": "blue" })))
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Validation(ValidationError::ForeignField { owner: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_all_violations_are_reported_together() {
        let validator = validator(true).await;
        let err = validator
            .parse(
                Some("tesseract"),
                &params(json!({
                    "psm": 14,
                    "oem": "lots",
                    "lang": ["eng", "fra", "deu", "spa", "ita", "por"],
                })),
            )
            .unwrap_err();
        let SubmitError::Validation(ValidationError::InvalidFields(violations)) = err else {
            panic!("unexpected error: {err:?}");
        };
        let fields = violations.iter().map(|v| v.field.as_str()).collect::<Vec<_>>();
        assert_eq!(fields, ["lang", "oem", "psm"]);
        assert!(violations[0].message.contains("at most 5"));
    }

    #[tokio::test]
    async fn test_strings_are_coerced_for_scalars() {
        let validator = validator(true).await;
        let config = validator
            .parse(
                Some("easyocr"),
                &params(json!({
                    "gpu": "false",
                    "text_threshold": "0.5",
                    "decoder": "beamsearch",
                })),
            )
            .unwrap();
        let EngineConfig::EasyOcr(config) = config else {
            panic!("wrong engine");
        };
        assert!(!config.gpu);
        assert_eq!(config.text_threshold, 0.5);
        assert_eq!(config.decoder, easyocr::Decoder::Beamsearch);
    }

    #[tokio::test]
    async fn test_cross_field_page_range() {
        let validator = validator(true).await;
        let err = validator
            .parse(
                Some("pdftotext"),
                &params(json!({ "first_page": 5, "last_page": 2 })),
            )
            .unwrap_err();
        let SubmitError::Validation(ValidationError::InvalidFields(violations)) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(violations[0].field, "last_page");
    }

    #[tokio::test]
    async fn test_unsupported_languages_are_all_listed() {
        let validator = validator(true).await;
        let err = validator
            .parse(Some("tesseract"), &params(json!({ "lang": "eng+xxx+yyy" })))
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::Validation(ValidationError::UnsupportedLanguage {
                engine: "tesseract".to_owned(),
                codes: vec!["xxx".to_owned(), "yyy".to_owned()],
            })
        );
    }

    #[tokio::test]
    async fn test_unavailable_engine_is_an_availability_error() {
        let validator = validator(false).await;
        let err = validator
            .parse(Some("easyocr"), &params(json!({ "languages": ["en"] })))
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Availability(AvailabilityError::NotInstalled { .. })
        ));
        assert_eq!(err.kind(), "engine_unavailable");
    }

    #[tokio::test]
    async fn test_missing_and_unknown_engines() {
        let validator = validator(true).await;
        assert_eq!(
            validator.parse(None, &RawParams::new()).unwrap_err(),
            SubmitError::Validation(ValidationError::MissingEngine)
        );
        assert_eq!(
            validator.parse(Some("  "), &RawParams::new()).unwrap_err(),
            SubmitError::Validation(ValidationError::MissingEngine)
        );
        assert_eq!(
            validator.parse(Some("ocropus"), &RawParams::new()).unwrap_err(),
            SubmitError::Validation(ValidationError::UnknownEngine("ocropus".to_owned()))
        );
    }

    #[test]
    fn test_declared_fields_match_config_structs() {
        fn properties(schema: schemars::schema::RootSchema) -> Vec<String> {
            let mut names = schema
                .schema
                .object
                .map(|o| o.properties.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            names.sort();
            names
        }
        fn declared(schema: &ConfigSchema) -> Vec<String> {
            let mut names = schema
                .fields
                .iter()
                .map(|f| f.name.to_owned())
                .collect::<Vec<_>>();
            names.sort();
            names
        }
        assert_eq!(
            declared(&tesseract::CONFIG_SCHEMA),
            properties(schemars::schema_for!(TesseractConfig))
        );
        assert_eq!(
            declared(&easyocr::CONFIG_SCHEMA),
            properties(schemars::schema_for!(EasyOcrConfig))
        );
        assert_eq!(
            declared(&pdftotext::CONFIG_SCHEMA),
            properties(schemars::schema_for!(PdfToTextConfig))
        );
    }

    #[test]
    fn test_published_limits_match_validation() {
        fn check(declared: &ConfigSchema, schema: schemars::schema::RootSchema) {
            let properties = schema.schema.object.unwrap().properties;
            for field in declared.fields {
                let schemars::schema::Schema::Object(property) = &properties[field.name] else {
                    panic!("{} has no schema", field.name);
                };
                let number = property.number.as_deref();
                let minimum = number.and_then(|n| n.minimum);
                let maximum = number.and_then(|n| n.maximum);
                match field.kind {
                    FieldKind::Integer { min, max } => {
                        assert_eq!(minimum, Some(min as f64), "{}", field.name);
                        // Limits that only restate the integer type aren't
                        // published.
                        if max < i64::from(u32::MAX) {
                            assert_eq!(maximum, Some(max as f64), "{}", field.name);
                        }
                    }
                    FieldKind::Number { min, max } => {
                        assert_eq!((minimum, maximum), (Some(min), Some(max)), "{}", field.name);
                    }
                    FieldKind::Languages { max } => {
                        let array = property.array.as_deref().unwrap();
                        assert_eq!(array.min_items, Some(1), "{}", field.name);
                        assert_eq!(array.max_items, Some(max as u32), "{}", field.name);
                    }
                    FieldKind::Bool | FieldKind::Choice(_) => {}
                }
            }
        }
        check(&tesseract::CONFIG_SCHEMA, schemars::schema_for!(TesseractConfig));
        check(&easyocr::CONFIG_SCHEMA, schemars::schema_for!(EasyOcrConfig));
        check(&pdftotext::CONFIG_SCHEMA, schemars::schema_for!(PdfToTextConfig));
    }
}
