use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Weight decay applied by both optimizer variants.
pub const WEIGHT_DECAY: f64 = 1e-4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let value: serde_json::Value = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        check_named_choices(&value)?;
        let mut config: TrainingConfig = serde_json::from_value(value)?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.root.as_os_str().is_empty() {
            errors.push("data.root must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.val_batch_size == 0 {
            errors.push("data.val_batch_size must be greater than 0".to_string());
        }

        if self.data.prefetch_factor == 0 {
            errors.push("data.prefetch_factor must be greater than 0".to_string());
        }

        // The backbone downsamples three times before the attention head.
        if self.data.image_size < 8 {
            errors.push("data.image_size must be at least 8".to_string());
        }

        if self.model.stem_channels == 0
            || self.model.feature_channels == 0
            || self.model.head_channels == 0
        {
            errors.push("model channel widths must be greater than 0".to_string());
        }

        if let Some(lr) = self.optimizer.learning_rate {
            if lr <= 0.0 {
                errors.push("optimizer.learning_rate must be greater than 0".to_string());
            }
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if !(self.scheduler.gamma > 0.0 && self.scheduler.gamma <= 1.0) {
            errors.push("scheduler.gamma must be in (0, 1]".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        let checkpoint = &self.runtime.checkpoint;
        if checkpoint.init_from.is_some() && checkpoint.resume_from.is_some() {
            errors.push(
                "runtime.checkpoint.init_from and runtime.checkpoint.resume_from are mutually exclusive"
                    .to_string(),
            );
        }

        if let Some(0) = self.runtime.checkpoint.max_keep_latest {
            errors.push("runtime.checkpoint.max_keep_latest must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.root, base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub attribute: Attribute,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_val_batch_size")]
    pub val_batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
    /// Square side length images are resized to.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            attribute: Attribute::default(),
            batch_size: default_batch_size(),
            val_batch_size: default_val_batch_size(),
            num_workers: default_num_workers(),
            prefetch_factor: default_prefetch_factor(),
            image_size: default_image_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_stem_channels")]
    pub stem_channels: usize,
    #[serde(default = "default_feature_channels")]
    pub feature_channels: usize,
    #[serde(default = "default_head_channels")]
    pub head_channels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            stem_channels: default_stem_channels(),
            feature_channels: default_feature_channels(),
            head_channels: default_head_channels(),
        }
    }
}

/// Sensitive attribute the adversary is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Attribute {
    Age,
    Gender,
    /// Idle case: the adversary predicts the emotion label itself.
    #[default]
    Emotion,
}

impl Attribute {
    pub fn num_classes(self) -> usize {
        match self {
            Attribute::Age => 5,
            Attribute::Gender => 2,
            Attribute::Emotion => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::Age => "age",
            Attribute::Gender => "gender",
            Attribute::Emotion => "emotion",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Attribute {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for Attribute {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "age" => Ok(Attribute::Age),
            "gender" => Ok(Attribute::Gender),
            "emotion" => Ok(Attribute::Emotion),
            other => Err(TrainingError::configuration(format!(
                "unsupported sensitive attribute '{}' (expected age, gender or emotion)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    /// Falls back to [`OptimizerType::default_learning_rate`] when unset.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl OptimizerConfig {
    pub fn effective_learning_rate(&self) -> f64 {
        self.learning_rate
            .unwrap_or_else(|| self.algorithm.default_learning_rate())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: None,
            momentum: default_momentum(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum OptimizerType {
    #[default]
    Adam,
    Sgd,
}

impl OptimizerType {
    pub fn default_learning_rate(self) -> f64 {
        match self {
            OptimizerType::Adam => 1e-3,
            OptimizerType::Sgd => 1e-2,
        }
    }
}

impl TryFrom<String> for OptimizerType {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for OptimizerType {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerType::Adam),
            "sgd" => Ok(OptimizerType::Sgd),
            other => Err(TrainingError::configuration(format!(
                "optimizer '{}' not supported (expected adam or sgd)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Multiplicative learning-rate decay applied once per epoch.
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            seed: default_seed(),
            precision: Precision::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        self.checkpoint.apply_base_path(base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    /// Checkpoint directory or bare safetensors file to initialise the backbone from.
    #[serde(default)]
    pub init_from: Option<PathBuf>,
    /// Checkpoint directory to continue a run from, restoring every component.
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
    #[serde(default)]
    pub max_keep_latest: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            init_from: None,
            resume_from: None,
            max_keep_latest: None,
        }
    }
}

impl CheckpointConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.directory, base);
        for path in [self.init_from.as_mut(), self.resume_from.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

/// Numeric mode of the run. `Mixed` keeps fp32 weights and enables dynamic loss
/// scaling around backward/step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Precision {
    Fp32,
    #[default]
    Mixed,
}

impl TryFrom<String> for Precision {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for Precision {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fp32" => Ok(Precision::Fp32),
            "mixed" | "o1" => Ok(Precision::Mixed),
            other => Err(TrainingError::configuration(format!(
                "unsupported precision '{}' (expected fp32 or mixed)",
                other
            ))),
        }
    }
}

/// Parses the enum-valued fields with `FromStr` first, so an unknown name in a
/// file fails the same way as on the command line.
fn check_named_choices(value: &serde_json::Value) -> Result<(), TrainingError> {
    let choices: [(&str, fn(&str) -> Result<(), TrainingError>); 3] = [
        ("/data/attribute", |name: &str| name.parse::<Attribute>().map(|_| ())),
        ("/optimizer/algorithm", |name: &str| name.parse::<OptimizerType>().map(|_| ())),
        ("/runtime/precision", |name: &str| name.parse::<Precision>().map(|_| ())),
    ];
    for (pointer, parse) in choices {
        if let Some(name) = value.pointer(pointer).and_then(|field| field.as_str()) {
            parse(name)?;
        }
    }
    Ok(())
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./datasets/raf-basic/")
}

fn default_batch_size() -> usize {
    256
}

fn default_val_batch_size() -> usize {
    64
}

fn default_num_workers() -> usize {
    4
}

fn default_prefetch_factor() -> usize {
    2
}

fn default_image_size() -> usize {
    224
}

fn default_stem_channels() -> usize {
    32
}

fn default_feature_channels() -> usize {
    64
}

fn default_head_channels() -> usize {
    128
}

fn default_momentum() -> f64 {
    0.9
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_gamma() -> f64 {
    0.9
}

fn default_epochs() -> usize {
    70
}

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("models/RAF-DB")
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush_every_n() -> usize {
    1
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Configuration(String),
    Manifest {
        path: PathBuf,
        line: Option<usize>,
        message: String,
    },
    Image {
        path: PathBuf,
        message: String,
    },
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn manifest(path: impl Into<PathBuf>, line: Option<usize>, message: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub fn image(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Image {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "I/O error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            TrainingError::Manifest {
                path,
                line: Some(line),
                message,
            } => write!(f, "manifest error at {}:{}: {}", path.display(), line, message),
            TrainingError::Manifest {
                path,
                line: None,
                message,
            } => write!(f, "manifest error in {}: {}", path.display(), message),
            TrainingError::Image { path, message } => {
                write!(f, "failed to read image {}: {}", path.display(), message)
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_command_line_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.data.batch_size, 256);
        assert_eq!(config.data.val_batch_size, 64);
        assert_eq!(config.data.num_workers, 4);
        assert_eq!(config.data.attribute, Attribute::Emotion);
        assert_eq!(config.runtime.epochs, 70);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Adam);
        assert_eq!(config.optimizer.effective_learning_rate(), 1e-3);
        assert_eq!(config.scheduler.gamma, 0.9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sgd_uses_its_own_default_rate() {
        let config = OptimizerConfig {
            algorithm: OptimizerType::Sgd,
            ..OptimizerConfig::default()
        };
        assert_eq!(config.effective_learning_rate(), 0.01);
    }

    #[test]
    fn unknown_names_are_configuration_errors() {
        assert!(matches!(
            "ethnicity".parse::<Attribute>(),
            Err(TrainingError::Configuration(_))
        ));
        assert!(matches!(
            "rmsprop".parse::<OptimizerType>(),
            Err(TrainingError::Configuration(_))
        ));
        assert_eq!("Gender".parse::<Attribute>().unwrap(), Attribute::Gender);
        assert_eq!(Attribute::Age.num_classes(), 5);
        assert_eq!(Attribute::Gender.num_classes(), 2);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TrainingConfig::default();
        config.data.batch_size = 0;
        config.runtime.epochs = 0;
        config.scheduler.gamma = 1.5;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn toml_sections_fall_back_to_defaults() {
        let config: TrainingConfig = toml::from_str(
            r#"
            [data]
            root = "data/raf"
            attribute = "gender"
            batch_size = 8

            [optimizer]
            algorithm = "sgd"
            learning_rate = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(config.data.attribute, Attribute::Gender);
        assert_eq!(config.data.val_batch_size, 64);
        assert_eq!(config.optimizer.effective_learning_rate(), 0.05);
        assert_eq!(config.runtime.precision, Precision::Mixed);
    }

    #[test]
    fn unknown_names_in_files_are_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("run.toml");
        fs::write(&toml_path, "[data]\nattribute = \"ethnicity\"\n").unwrap();
        assert!(matches!(
            TrainingConfig::from_path(&toml_path),
            Err(TrainingError::Configuration(_))
        ));

        let json_path = dir.path().join("run.json");
        fs::write(&json_path, r#"{"optimizer": {"algorithm": "rmsprop"}}"#).unwrap();
        assert!(matches!(
            TrainingConfig::from_path(&json_path),
            Err(TrainingError::Configuration(_))
        ));
    }

    #[test]
    fn file_choices_parse_like_command_line_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            concat!(
                "[data]\nattribute = \"Gender\"\n",
                "[optimizer]\nalgorithm = \"SGD\"\n",
                "[runtime]\nprecision = \"o1\"\n",
            ),
        )
        .unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.data.attribute, Attribute::Gender);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Sgd);
        assert_eq!(config.runtime.precision, Precision::Mixed);
        assert!(config.data.root.starts_with(dir.path()));
    }
}
