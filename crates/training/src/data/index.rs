use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::config::{Attribute, TrainingError};

use super::Result;

pub const EMOTION_MANIFEST: &str = "EmoLabel/list_patition_label.txt";
pub const AGE_MANIFEST: &str = "AgeLabel/list_patition_label.txt";
pub const GENDER_MANIFEST: &str = "GenderLabel/list_patition_label.txt";

/// Raw gender value marking a sample excluded from the study.
pub const GENDER_SENTINEL: i64 = 2;

/// Dataset partition selected by identifier prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    /// Whether `identifier` carries this split's prefix. Rows with any other
    /// prefix belong to neither split.
    pub fn matches(self, identifier: &str) -> bool {
        identifier.starts_with(self.prefix())
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }

    pub fn is_train(self) -> bool {
        matches!(self, Split::Train)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train | Split::Test => f.write_str(self.prefix()),
        }
    }
}

impl FromStr for Split {
    type Err = TrainingError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "train" => Ok(Split::Train),
            "test" | "val" | "validation" => Ok(Split::Test),
            other => Err(TrainingError::configuration(format!(
                "unknown split '{}'",
                other
            ))),
        }
    }
}

/// Static metadata of one indexed sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub image_path: PathBuf,
    pub stem: String,
    /// Zero-based emotion class in `[0, 6]`.
    pub emotion_label: u32,
    pub sensitive_label: u32,
}

/// One parsed manifest row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRow {
    pub identifier: String,
    pub value: i64,
    pub line: usize,
}

/// Ordered, split-filtered view over the RAF-DB label manifests.
#[derive(Debug, Clone)]
pub struct DatasetIndex {
    root: PathBuf,
    split: Split,
    attribute: Attribute,
    records: Vec<SampleRecord>,
}

impl DatasetIndex {
    pub fn load(root: impl AsRef<Path>, split: Split, attribute: Attribute) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let emotion_path = root.join(EMOTION_MANIFEST);
        let emotion_rows = read_manifest(&emotion_path)?;

        let mut emotions = Vec::new();
        for row in emotion_rows.into_iter().filter(|row| split.matches(&row.identifier)) {
            if !(1..=7).contains(&row.value) {
                return Err(TrainingError::manifest(
                    &emotion_path,
                    Some(row.line),
                    format!("emotion label {} outside [1, 7]", row.value),
                ));
            }
            emotions.push((row.identifier, (row.value - 1) as u32));
        }

        let records = match attribute {
            Attribute::Emotion => emotions
                .into_iter()
                .map(|(identifier, emotion)| record(&root, &identifier, emotion, emotion))
                .collect(),
            Attribute::Age | Attribute::Gender => {
                let sensitive = load_sensitive(&root, split, attribute)?;
                let known: HashSet<&str> = emotions.iter().map(|(id, _)| id.as_str()).collect();
                if let Some((identifier, line)) = sensitive
                    .iter()
                    .filter(|(identifier, _)| !known.contains(identifier.as_str()))
                    .map(|(identifier, (_, line))| (identifier.clone(), *line))
                    .min_by_key(|(_, line)| *line)
                {
                    return Err(TrainingError::manifest(
                        root.join(attribute_manifest(attribute)),
                        Some(line),
                        format!("'{}' has no emotion label", identifier),
                    ));
                }

                emotions
                    .iter()
                    .filter_map(|(identifier, emotion)| {
                        sensitive.get(identifier).map(|(value, _)| {
                            record(&root, identifier, *emotion, *value)
                        })
                    })
                    .collect()
            }
        };

        Ok(Self {
            root,
            split,
            attribute,
            records,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    pub fn num_sensitive_classes(&self) -> usize {
        self.attribute.num_classes()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SampleRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    /// Fails on the first record whose aligned image is absent.
    pub fn verify_files(&self) -> Result<()> {
        match self.records.iter().find(|record| !record.image_path.is_file()) {
            Some(missing) => Err(TrainingError::manifest(
                self.root.join(EMOTION_MANIFEST),
                None,
                format!(
                    "image for '{}' not found at {}",
                    missing.stem,
                    missing.image_path.display()
                ),
            )),
            None => Ok(()),
        }
    }
}

/// `<root>/Image/aligned/<stem>_aligned.jpg`
pub fn aligned_image_path(root: &Path, identifier: &str) -> PathBuf {
    root.join("Image")
        .join("aligned")
        .join(format!("{}_aligned.jpg", image_stem(identifier)))
}

/// Identifier up to its first `.`, e.g. `train_00001.jpg` -> `train_00001`.
pub fn image_stem(identifier: &str) -> &str {
    identifier.split('.').next().unwrap_or(identifier)
}

/// Parses a whitespace separated `(identifier, integer)` manifest.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRow>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        TrainingError::manifest(path, None, format!("failed to read manifest: {}", err))
    })?;
    parse_manifest(path, &contents)
}

pub fn parse_manifest(path: &Path, contents: &str) -> Result<Vec<ManifestRow>> {
    let mut rows = Vec::new();
    for (offset, line) in contents.lines().enumerate() {
        let line_number = offset + 1;
        let mut fields = line.split_whitespace();
        let Some(identifier) = fields.next() else {
            continue;
        };
        let Some(raw) = fields.next() else {
            return Err(TrainingError::manifest(
                path,
                Some(line_number),
                format!("expected '<identifier> <label>', got '{}'", line.trim()),
            ));
        };
        let value = raw.parse::<i64>().map_err(|_| {
            TrainingError::manifest(
                path,
                Some(line_number),
                format!("label '{}' is not an integer", raw),
            )
        })?;
        rows.push(ManifestRow {
            identifier: identifier.to_string(),
            value,
            line: line_number,
        });
    }
    Ok(rows)
}

fn attribute_manifest(attribute: Attribute) -> &'static str {
    match attribute {
        Attribute::Age => AGE_MANIFEST,
        Attribute::Gender => GENDER_MANIFEST,
        Attribute::Emotion => EMOTION_MANIFEST,
    }
}

/// Split-filtered sensitive labels keyed by identifier, with their manifest line.
fn load_sensitive(
    root: &Path,
    split: Split,
    attribute: Attribute,
) -> Result<HashMap<String, (u32, usize)>> {
    let path = root.join(attribute_manifest(attribute));
    let classes = attribute.num_classes() as i64;
    let mut labels = HashMap::new();

    for row in read_manifest(&path)? {
        if !split.matches(&row.identifier) {
            continue;
        }
        if attribute == Attribute::Gender && row.value == GENDER_SENTINEL {
            continue;
        }
        if !(0..classes).contains(&row.value) {
            return Err(TrainingError::manifest(
                &path,
                Some(row.line),
                format!(
                    "{} value {} outside [0, {}]",
                    attribute,
                    row.value,
                    classes - 1
                ),
            ));
        }
        labels.insert(row.identifier, (row.value as u32, row.line));
    }

    Ok(labels)
}

fn record(root: &Path, identifier: &str, emotion_label: u32, sensitive_label: u32) -> SampleRecord {
    SampleRecord {
        image_path: aligned_image_path(root, identifier),
        stem: image_stem(identifier).to_string(),
        emotion_label,
        sensitive_label,
    }
}
