use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::{
    context::Ctx,
    error::{Error, Result},
};

/// One batch at a time, process wide.
static BATCH_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Restores the working directory when dropped.
struct WorkDir {
    previous: PathBuf,
}

impl WorkDir {
    fn enter(dir: &Path) -> std::io::Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir(&self.previous) {
            error!("Could not return to {}: {err}", self.previous.display());
        }
    }
}

/// Splits a batch line into fields.
///
/// Fields are separated by spaces, double quotes group a field and `""`
/// inside quotes is a literal quote. A line starting with `#` is a comment
/// and yields no fields.
///
/// # Errors
/// Returns `InvalidInput` on an unterminated quote.
pub fn split_line(line: &str) -> Result<Vec<String>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.starts_with('#') {
        return Ok(Vec::new());
    }

    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => {
                quoted = true;
                was_quoted = true;
            }
            (' ', false) => {
                if !field.is_empty() || was_quoted {
                    fields.push(std::mem::take(&mut field));
                }
                was_quoted = false;
            }
            (c, _) => field.push(c),
        }
    }

    if quoted {
        return Err(Error::invalid(
            "Problem while reading CSV command file: unterminated quote",
        ));
    }

    if !field.is_empty() || was_quoted {
        fields.push(field);
    }

    Ok(fields)
}

impl Ctx {
    /// Runs every command in a `.cli` file, stopping at the first failure.
    ///
    /// The working directory is the file's directory while the batch runs.
    ///
    /// # Errors
    /// `Unauthorized` unless the caller is an elevated sysadmin, `InvalidInput`
    /// for other file types or a batch started from inside a batch, I/O
    /// errors, or the first failing command.
    pub async fn batch(&mut self, filename: &str) -> Result<()> {
        if !self.is_sysadmin() {
            return Err(Error::unauthorized(
                "Batch commands require sysadmin permissions",
            ));
        }

        // The lock is already held by this context.
        if self.in_batch {
            return Err(Error::invalid("Batch files cannot start other batch files"));
        }

        let _lock = BATCH_LOCK.lock().await;

        self.in_batch = true;
        let result = self.batch_file(filename).await;
        self.in_batch = false;
        result
    }

    async fn batch_file(&mut self, filename: &str) -> Result<()> {
        if filename.len() <= 4 || !filename.ends_with(".cli") {
            return Err(Error::invalid("Not a .cli batch file"));
        }

        self.outln(format!("Opening batch file: {filename}"));
        let path = Path::new(filename);
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::invalid(format!("Could not open {filename}: {err}")))?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        self.outln(format!("Changing work-directory to {}", dir.display()));
        let _workdir = WorkDir::enter(&dir)
            .map_err(|err| Error::internal(format!("Could not change directory: {err}")))?;

        info!("Running batch file {filename}");

        let mut result = Ok(());
        for line in contents.lines() {
            let fields = match split_line(line) {
                Ok(fields) => fields,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };

            self.outln(format!("Command: {fields:?}"));

            if fields.is_empty() {
                continue;
            }

            if let Err(err) = self.cmd(fields).await {
                result = Err(err);
                break;
            }
        }

        self.outln("Batch processing done");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{core::testing::offline_core, error::ErrorKind, model::Principal};

    async fn operator() -> Ctx {
        let mut root = Principal {
            ident: "root".to_string(),
            sysadmin: true,
            ..Principal::default()
        };
        root.set_elevated(true);

        let mut ctx = Ctx::local(offline_core().await);
        ctx.act_as(root);
        ctx
    }

    fn write_cli(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn plain_fields() {
        assert_eq!(
            split_line("system set app_name Tickly").unwrap(),
            vec!["system", "set", "app_name", "Tickly"]
        );
    }

    #[test]
    fn quoted_fields() {
        assert_eq!(
            split_line(r#"user set alice descr "Alice ""Al"" Liddell""#).unwrap(),
            vec!["user", "set", "alice", "descr", r#"Alice "Al" Liddell"#]
        );
        assert_eq!(split_line(r#"a "" b"#).unwrap(), vec!["a", "", "b"]);
    }

    #[test]
    fn comments_and_blanks() {
        assert!(split_line("# a comment").unwrap().is_empty());
        assert!(split_line("").unwrap().is_empty());
        assert_eq!(split_line("whoami  ").unwrap(), vec!["whoami"]);
    }

    #[test]
    fn unterminated_quote() {
        assert!(split_line(r#"echo "oops"#).is_err());
    }

    #[tokio::test]
    async fn nested_batch_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = write_cli(tmp.path(), "inner.cli", "# nothing\n");
        let outer = write_cli(tmp.path(), "outer.cli", &format!("system batch {inner}\n"));

        let mut ctx = operator().await;
        let err = tokio::time::timeout(Duration::from_secs(5), ctx.batch(&outer))
            .await
            .expect("nested batch must not wait on itself")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "Batch files cannot start other batch files");

        // The flag is cleared once the outer batch is done.
        ctx.batch(&inner).await.unwrap();
    }

    #[tokio::test]
    async fn batches_run_one_at_a_time() {
        let tmp = tempfile::tempdir().unwrap();
        let file = write_cli(tmp.path(), "quiet.cli", "# nothing to do\n");
        let mut ctx = operator().await;

        let held = BATCH_LOCK.lock().await;
        let waited = tokio::time::timeout(Duration::from_millis(200), ctx.batch(&file)).await;
        assert!(waited.is_err(), "batch ran while another held the lock");
        drop(held);

        tokio::time::timeout(Duration::from_secs(5), ctx.batch(&file))
            .await
            .unwrap()
            .unwrap();
        assert!(!ctx.in_batch);
    }

    #[tokio::test]
    async fn workdir_is_restored() {
        // Batches move the working directory too.
        let _lock = BATCH_LOCK.lock().await;
        let before = std::env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        {
            let _guard = WorkDir::enter(tmp.path()).unwrap();
            assert_eq!(
                std::env::current_dir().unwrap().canonicalize().unwrap(),
                tmp.path().canonicalize().unwrap()
            );
        }
        assert_eq!(std::env::current_dir().unwrap(), before);
    }
}
