use crate::dataset::{AttrValue, Attrs, TIME, UNITS};
use crate::error::{PipelineError, Result};
use crate::load::OutputFormat;
use crate::qc::{Checker, Handler};
use crate::retrieve::ReaderKind;
use crate::storage::VersionPolicy;
use crate::transform::Method;
use crate::units;
use log::{debug, warn};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Keyword that expands to every declared data variable in QC bindings.
pub const DATA_VARS: &str = "DATA_VARS";

const REQUIRED_ATTRS: [&str; 8] = [
    "title",
    "description",
    "conventions",
    "code_url",
    "location_id",
    "instrument_id",
    "datastream",
    "data_level",
];

const DATASTREAM_COMPONENTS: [&str; 5] = [
    "location_id",
    "instrument_id",
    "qualifier",
    "temporal",
    "data_level",
];

/// Mapping that keeps YAML declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V>(Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.0.iter().map(|(_, v)| v)
    }

    fn values_mut(&mut self) -> impl Iterator<Item = (&String, &mut V)> {
        self.0.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V> FromIterator<(String, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for MapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of names to definitions")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, V)> = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate key '{key}'")));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineType {
    #[default]
    #[serde(alias = "Ingest")]
    Ingest,
    #[serde(alias = "VAP")]
    Vap,
}

impl PipelineType {
    /// Default data level of the pipeline's output datastream.
    pub fn data_level(self) -> &'static str {
        match self {
            PipelineType::Ingest => "b1",
            PipelineType::Vap => "c1",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    pub name: String,
    #[serde(rename = "type", default)]
    pub pipeline_type: PipelineType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Input keys matching this pattern are read by this reader.
    pub regex: String,
    #[serde(flatten)]
    pub kind: ReaderKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrieverConfig {
    pub readers: Vec<ReaderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillKeyword {
    Fill,
}

/// Explicit policy for a source column that is absent from the input:
/// `default: 4.5`, `default: {value: 4.5}` or `default: fill`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultPolicy {
    Value(f64),
    Mapping { value: f64 },
    Fill(FillKeyword),
}

impl DefaultPolicy {
    /// The configured constant, or `None` to use `_FillValue`.
    pub fn value(self) -> Option<f64> {
        match self {
            DefaultPolicy::Value(value) | DefaultPolicy::Mapping { value } => Some(value),
            DefaultPolicy::Fill(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrieveConfig {
    /// Column name in the raw input.
    pub name: String,
    /// Units of the raw input values.
    #[serde(default)]
    pub units: Option<String>,
    /// `chrono` format for text timestamps, e.g. `%Y-%m-%d %H:%M:%S`.
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub default: Option<DefaultPolicy>,
}

/// Declaration of one coordinate or data variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub dims: Vec<String>,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub retrieve: Option<RetrieveConfig>,
    /// Predefined values, used instead of retrieval.
    #[serde(default)]
    pub data: Option<Vec<f64>>,
}

impl VariableConfig {
    pub fn dim(&self) -> &str {
        self.dims.first().map(String::as_str).unwrap_or(TIME)
    }

    pub fn units(&self) -> Option<&str> {
        self.attrs.get(UNITS).and_then(AttrValue::as_str)
    }

    /// Units of the retrieved values; falls back to the target units.
    pub fn source_units(&self) -> Option<&str> {
        self.retrieve
            .as_ref()
            .and_then(|r| r.units.as_deref())
            .or_else(|| self.units())
    }

    /// Derived variables have neither a source nor predefined data and start
    /// out filled with `_FillValue`.
    pub fn is_derived(&self) -> bool {
        self.retrieve.is_none() && self.data.is_none()
    }
}

/// Declared output schema: global attributes, coordinates and data
/// variables in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetDefinition {
    #[serde(default)]
    pub attrs: Attrs,
    pub coords: OrderedMap<VariableConfig>,
    #[serde(default)]
    pub data_vars: OrderedMap<VariableConfig>,
}

impl DatasetDefinition {
    pub fn variables(&self) -> impl Iterator<Item = &VariableConfig> {
        self.coords.values().chain(self.data_vars.values())
    }

    pub fn get(&self, name: &str) -> Option<&VariableConfig> {
        self.coords.get(name).or_else(|| self.data_vars.get(name))
    }

    pub fn is_coordinate(&self, name: &str) -> bool {
        self.coords.contains_key(name)
    }

    pub fn datastream(&self) -> &str {
        self.attrs
            .get("datastream")
            .and_then(AttrValue::as_str)
            .unwrap_or_default()
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(AttrValue::as_str)
    }

    fn finalize(&mut self, pipeline_type: PipelineType) -> Result<()> {
        for (name, var) in self.coords.values_mut() {
            var.name = name.clone();
            if var.dims.is_empty() {
                var.dims = vec![name.clone()];
            }
        }
        for (name, var) in self.data_vars.values_mut() {
            var.name = name.clone();
            if var.dims.is_empty() {
                var.dims = vec![TIME.to_string()];
            }
        }

        if !self.attrs.contains_key("data_level") {
            self.attrs.insert(
                "data_level".to_string(),
                AttrValue::from(pipeline_type.data_level()),
            );
        }
        let datastream = format!(
            "{}.{}{}{}.{}",
            self.attr("location_id").unwrap_or_default(),
            self.attr("instrument_id").unwrap_or_default(),
            self.attr("qualifier").unwrap_or_default(),
            self.attr("temporal").unwrap_or_default(),
            self.attr("data_level").unwrap_or_default(),
        );
        self.attrs
            .insert("datastream".to_string(), AttrValue::from(datastream));

        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if !self.coords.contains_key(TIME) {
            return Err(PipelineError::Config(
                "'time' must be defined as a coordinate variable".to_string(),
            ));
        }
        for coord in self.coords.values() {
            if coord.dims.len() != 1 || coord.dims[0] != coord.name {
                return Err(PipelineError::Config(format!(
                    "coordinate variable '{}' must be dimensioned by itself only",
                    coord.name
                )));
            }
            if coord.is_derived() {
                return Err(PipelineError::Config(format!(
                    "coordinate variable '{}' must be retrieved or predefined",
                    coord.name
                )));
            }
        }
        for var in self.data_vars.values() {
            if self.coords.contains_key(&var.name) {
                return Err(PipelineError::Config(format!(
                    "'{}' is declared as both a coordinate and a data variable",
                    var.name
                )));
            }
            if var.dims.len() != 1 {
                return Err(PipelineError::Config(format!(
                    "data variable '{}' must have exactly one dimension",
                    var.name
                )));
            }
            if !self.coords.contains_key(var.dim()) {
                return Err(PipelineError::Config(format!(
                    "data variable '{}' uses dimension '{}' which has no coordinate variable",
                    var.name,
                    var.dim()
                )));
            }
        }
        for var in self.variables() {
            if let (Some(source), Some(target)) = (var.source_units(), var.units()) {
                units::conversion(source, target).map_err(|e| {
                    PipelineError::Config(format!("variable '{}': {}", var.name, e))
                })?;
            }
            if var.retrieve.is_some() && var.data.is_some() {
                return Err(PipelineError::Config(format!(
                    "variable '{}' cannot be both retrieved and predefined",
                    var.name
                )));
            }
        }

        for attr in REQUIRED_ATTRS {
            let present = match self.attrs.get(attr) {
                Some(AttrValue::Text(s)) => !s.trim().is_empty(),
                Some(_) => true,
                None => false,
            };
            if !present {
                return Err(PipelineError::Config(format!(
                    "'{attr}' is a required global attribute"
                )));
            }
        }
        for attr in DATASTREAM_COMPONENTS {
            if self.attr(attr).is_some_and(|v| v.contains('.')) {
                return Err(PipelineError::Config(format!(
                    "'.' is not an allowed character for {attr}"
                )));
            }
        }

        let data_level = self.attr("data_level").ok_or_else(|| {
            PipelineError::Config("data level must be a string".to_string())
        })?;
        let chars: Vec<char> = data_level.chars().collect();
        if chars.len() != 2 {
            return Err(PipelineError::Config(
                "data level must consist of two characters".to_string(),
            ));
        }
        if data_level == "00" {
            warn!("Data level chosen is 00, which is not recommended");
        } else if !chars[0].is_ascii_alphabetic() || !chars[1].is_ascii_digit() {
            return Err(PipelineError::Config(format!(
                "data level '{data_level}' must be a letter followed by a digit"
            )));
        }
        Ok(())
    }
}

/// One QC test bound to one or more variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QcTestConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Variable names, or `DATA_VARS` for every data variable.
    pub variables: Vec<String>,
    pub checker: Checker,
    #[serde(default)]
    pub handlers: Vec<Handler>,
    /// Internal errors of critical tests abort the run.
    #[serde(default)]
    pub critical: bool,
}

impl QcTestConfig {
    pub fn reason(&self) -> String {
        if self.description.trim().is_empty() {
            format!("failed {}", self.name)
        } else {
            self.description.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityConfig {
    #[serde(default)]
    pub tests: Vec<QcTestConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResampleConfig {
    #[serde(default = "default_resample_dim")]
    pub dim: String,
    /// Bin width in coordinate units (seconds for `time`).
    pub interval: f64,
    /// Alignment anchor: bin edges fall on `origin + k * interval`.
    /// Defaults to 0.
    #[serde(default)]
    pub origin: Option<f64>,
    #[serde(default)]
    pub methods: BTreeMap<String, Method>,
    #[serde(default)]
    pub default_method: Option<Method>,
}

fn default_resample_dim() -> String {
    TIME.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    /// Output names for declared variables, applied after resampling.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub resample: Option<ResampleConfig>,
}

/// Where and how records are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub policy: VersionPolicy,
    /// Extra output formats written next to the canonical parquet tables.
    #[serde(default)]
    pub formats: Vec<OutputFormat>,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage/root")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            policy: VersionPolicy::default(),
            formats: Vec::new(),
        }
    }
}

/// Complete, validated declaration of one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub retriever: RetrieverConfig,
    pub dataset: DatasetDefinition,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl PipelineConfig {
    /// Loads one or more YAML files. Every document of every file is merged
    /// at the top level, later keys replacing earlier ones.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = serde_yaml::Mapping::new();
        for path in paths {
            let path = path.as_ref();
            debug!("Loading config file: {}", path.display());
            let text = std::fs::read_to_string(path)?;
            merge_documents(&mut merged, &text)?;
        }
        Self::from_value(serde_yaml::Value::Mapping(merged))
    }

    /// Parses and validates config text. Multiple YAML documents are merged
    /// the same way as multiple files.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Yaml` for malformed YAML and
    /// `PipelineError::Config` for a config that fails validation.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut merged = serde_yaml::Mapping::new();
        merge_documents(&mut merged, text)?;
        Self::from_value(serde_yaml::Value::Mapping(merged))
    }

    fn from_value(value: serde_yaml::Value) -> Result<Self> {
        let mut config: PipelineConfig = serde_yaml::from_value(value)?;
        config.finalize()?;
        Ok(config)
    }

    fn finalize(&mut self) -> Result<()> {
        self.dataset.finalize(self.pipeline.pipeline_type)?;

        if self.retriever.readers.is_empty() {
            return Err(PipelineError::Config(
                "retriever must declare at least one reader".to_string(),
            ));
        }
        for reader in &self.retriever.readers {
            regex::Regex::new(&reader.regex).map_err(|e| {
                PipelineError::Config(format!("invalid reader regex '{}': {}", reader.regex, e))
            })?;
        }

        let mut seen = Vec::new();
        for test in &self.quality.tests {
            if seen.contains(&test.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate QC test name '{}'",
                    test.name
                )));
            }
            seen.push(test.name.as_str());
            if test.variables.is_empty() {
                return Err(PipelineError::Config(format!(
                    "QC test '{}' binds no variables",
                    test.name
                )));
            }
            for name in &test.variables {
                if name != DATA_VARS && self.dataset.get(name).is_none() {
                    return Err(PipelineError::Config(format!(
                        "QC test '{}' references undeclared variable '{}'",
                        test.name, name
                    )));
                }
            }
            for handler in &test.handlers {
                handler.validate().map_err(|e| {
                    PipelineError::Config(format!("QC test '{}': {}", test.name, e))
                })?;
            }
        }

        for (from, to) in &self.transform.rename {
            if from == TIME {
                return Err(PipelineError::Config(format!(
                    "the '{TIME}' coordinate cannot be renamed"
                )));
            }
            if self.dataset.get(from).is_none() {
                return Err(PipelineError::Config(format!(
                    "rename references undeclared variable '{from}'"
                )));
            }
            if to.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "rename of '{from}' has an empty target name"
                )));
            }
        }
        if let Some(resample) = &self.transform.resample {
            if !(resample.interval.is_finite() && resample.interval > 0.0) {
                return Err(PipelineError::Config(
                    "resample interval must be a positive number".to_string(),
                ));
            }
            if !self.dataset.is_coordinate(&resample.dim) {
                return Err(PipelineError::Config(format!(
                    "resample dimension '{}' is not a declared coordinate",
                    resample.dim
                )));
            }
            for name in resample.methods.keys() {
                if self.dataset.data_vars.get(name).is_none() {
                    return Err(PipelineError::Config(format!(
                        "resample method declared for unknown data variable '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn datastream(&self) -> &str {
        self.dataset.datastream()
    }

    /// SHA-256 over the canonical JSON form of the validated config.
    pub fn hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

fn merge_documents(merged: &mut serde_yaml::Mapping, text: &str) -> Result<()> {
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        match value {
            serde_yaml::Value::Mapping(map) => {
                for (k, v) in map {
                    merged.insert(k, v);
                }
            }
            serde_yaml::Value::Null => {}
            _ => {
                return Err(PipelineError::Config(
                    "each config document must be a mapping".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const BUOY_YAML: &str = r#"
pipeline:
  name: buoy_ingest
  type: Ingest
retriever:
  readers:
    - regex: '.*\.csv$'
      kind: csv
dataset:
  attrs:
    title: Buoy Ingest
    description: Surface temperature from a moored buoy
    conventions: CF-1.6
    code_url: https://example.org/buoy
    location_id: humboldt
    instrument_id: buoy
    qualifier: z05
  coords:
    time:
      attrs:
        units: seconds since 1970-01-01T00:00:00
      retrieve:
        name: time
  data_vars:
    temperature:
      attrs:
        units: K
        long_name: Water temperature
        _FillValue: -9999
      retrieve:
        name: temp_raw
        units: degC
quality:
  tests:
    - name: flag_sentinel
      description: Value is the -999 sentinel
      variables: [temperature]
      checker:
        type: check_sentinel
        value: -999
      handlers:
        - type: record_flag
"#;

    #[test]
    fn load_generates_datastream_and_data_level() {
        let config = PipelineConfig::from_yaml_str(BUOY_YAML).unwrap();
        assert_eq!(config.datastream(), "humboldt.buoyz05.b1");
        let names: Vec<&str> = config.dataset.variables().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["time", "temperature"]);
        assert_eq!(config.dataset.data_vars.get("temperature").unwrap().dim(), "time");
    }

    #[test]
    fn later_documents_override_earlier_sections() {
        let text = format!("{BUOY_YAML}\n---\nstorage:\n  root: /tmp/other\n  policy: version\n");
        let config = PipelineConfig::from_yaml_str(&text).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/tmp/other"));
        assert_eq!(config.storage.policy, VersionPolicy::Version);
    }

    #[test]
    fn missing_required_attribute_is_config_error() {
        let text = BUOY_YAML.replace("    title: Buoy Ingest\n", "");
        let err = PipelineConfig::from_yaml_str(&text).unwrap_err();
        assert!(matches!(err, PipelineError::Config(msg) if msg.contains("title")));
    }

    #[test]
    fn dotted_datastream_component_is_rejected() {
        let text = BUOY_YAML.replace("location_id: humboldt", "location_id: hum.boldt");
        assert!(matches!(
            PipelineConfig::from_yaml_str(&text),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn incompatible_units_fail_at_load() {
        let text = BUOY_YAML.replace("units: degC", "units: m");
        assert!(matches!(
            PipelineConfig::from_yaml_str(&text),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn qc_test_must_reference_declared_variables() {
        let text = BUOY_YAML.replace("variables: [temperature]", "variables: [salinity]");
        assert!(matches!(
            PipelineConfig::from_yaml_str(&text),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn hash_is_stable_across_loads() {
        let a = PipelineConfig::from_yaml_str(BUOY_YAML).unwrap();
        let b = PipelineConfig::from_yaml_str(BUOY_YAML).unwrap();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        assert_eq!(a.hash().unwrap().len(), 64);
    }

    #[test]
    fn vap_pipelines_default_to_c1() {
        let text = BUOY_YAML.replace("type: Ingest", "type: vap");
        let config = PipelineConfig::from_yaml_str(&text).unwrap();
        assert_eq!(config.datastream(), "humboldt.buoyz05.c1");
    }

    #[test]
    fn time_coordinate_cannot_be_renamed() {
        let text = format!("{BUOY_YAML}\ntransform:\n  rename:\n    time: timestamp\n");
        let err = PipelineConfig::from_yaml_str(&text).unwrap_err();
        assert!(matches!(err, PipelineError::Config(msg) if msg.contains("time")));
    }

    #[test]
    fn default_policy_forms() {
        let parse = |text: &str| serde_yaml::from_str::<DefaultPolicy>(text).unwrap();
        assert_eq!(parse("4.5").value(), Some(4.5));
        assert_eq!(parse("{value: 4.5}").value(), Some(4.5));
        assert_eq!(parse("fill").value(), None);
    }
}
