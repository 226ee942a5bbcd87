use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

/// Lower-cased set of known weak passwords.
#[derive(Debug, Default)]
pub struct WeakDictionary {
    words: HashSet<String>,
    files: usize,
}

impl WeakDictionary {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words.into_iter().map(|w| w.as_ref().to_lowercase()).collect(),
            files: 0,
        }
    }

    /// Loads every file; lines starting with `#` are comments.
    ///
    /// No files configured is only worth a warning.
    ///
    /// # Errors
    /// Returns an error if a configured file cannot be opened or read.
    #[instrument]
    pub fn load(files: &[PathBuf]) -> Result<Self> {
        let mut dict = Self::default();

        if files.is_empty() {
            warn!("No weak password dictionaries configured - skipping");
            return Ok(dict);
        }

        for path in files {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Could not open password dictionary {}", path.display()))?;

            let mut count = 0_usize;
            for line in BufReader::new(file).lines() {
                let line = line
                    .with_context(|| format!("Failed reading password dictionary {}", path.display()))?;

                let word = line.trim();
                if word.is_empty() || (word.len() > 1 && word.starts_with('#')) {
                    continue;
                }

                if dict.words.insert(word.to_lowercase()) {
                    count += 1;
                }
            }

            dict.files += 1;
            debug!("Loaded weak password dictionary {} ({count} passwords)", path.display());
        }

        if dict.words.is_empty() {
            warn!("Weak password dictionaries contain no passwords");
        } else {
            info!(
                "Loaded {} weak password dictionaries with {} unique passwords",
                dict.files,
                dict.words.len()
            );
        }

        Ok(dict)
    }

    #[must_use]
    pub fn is_weak(&self, password: &str) -> bool {
        self.words.contains(&password.to_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[must_use]
    pub fn details(&self) -> String {
        format!(
            "Password Dictionary Checker: Loaded {} Weak Password Dictionaries with {} unique passwords",
            self.files,
            self.words.len()
        )
    }
}
