use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{anyhow, Context, Result};
use reqwest::{header, StatusCode};
use tracing::debug;
use url::Url;

use crate::{
    api::handlers::command::EMPTY_ARG, cli::actions::exit_code, token::token_from_challenge,
    APP_USER_AGENT,
};

#[derive(Debug)]
pub struct Args {
    pub server: String,
    pub token_file: PathBuf,
    pub diagnostics: bool,
    pub args: Vec<String>,
}

/// What the server answered, after the token file has been brought up to date.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub return_code: i32,
    pub body: String,
    pub notes: Vec<String>,
}

/// `<server>/api/<arg>/<arg>..`, each argument one path segment.
/// # Errors
/// Returns an error if `server` is not a usable base URL.
pub fn request_url(server: &str, args: &[String]) -> Result<Url> {
    let mut url = Url::parse(server).with_context(|| format!("invalid server URL: {server}"))?;

    url.path_segments_mut()
        .map_err(|()| anyhow!("server URL cannot be a base: {server}"))?
        .pop_if_empty()
        .push("api")
        .extend(
            args.iter()
                .map(|arg| if arg.is_empty() { EMPTY_ARG } else { arg.as_str() }),
        );

    Ok(url)
}

fn read_token(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn save_token(path: &Path, token: &str) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(token.as_bytes())
}

fn remove_token(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Sends one command and keeps the token file in step with the answer.
/// # Errors
/// Returns an error if the server cannot be reached or the token file cannot
/// be written.
pub async fn call(args: &Args) -> Result<Reply> {
    let url = request_url(&args.server, &args.args)?;
    let client = reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .build()?;

    let mut request = client.get(url);
    if let Some(token) = read_token(&args.token_file) {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("could not reach {}", args.server))?;

    let status = response.status();
    let return_code = response
        .headers()
        .get("x-returncode")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(0);
    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;

    let mut notes = Vec::new();
    match challenge.as_deref().map(token_from_challenge) {
        Some(Some(token)) => {
            save_token(&args.token_file, token).with_context(|| {
                format!("could not write {}", args.token_file.display())
            })?;
            notes.push(format!("Token saved to {}", args.token_file.display()));
        }
        // A bare challenge or a 401 means the stored token is no good.
        Some(None) => {
            if remove_token(&args.token_file)? {
                notes.push(format!("Token removed from {}", args.token_file.display()));
            }
        }
        None if status == StatusCode::UNAUTHORIZED => {
            if remove_token(&args.token_file)? {
                notes.push(format!("Token removed from {}", args.token_file.display()));
            }
        }
        None => {}
    }

    Ok(Reply {
        status,
        return_code,
        body,
        notes,
    })
}

/// Execute the cli action.
/// # Errors
/// Returns an error if the server cannot be reached.
pub async fn execute(args: Args) -> Result<ExitCode> {
    let reply = call(&args).await?;
    debug!("HTTP status: {}", reply.status);

    let mut stdout = io::stdout().lock();
    stdout.write_all(reply.body.as_bytes())?;
    stdout.flush()?;

    if args.diagnostics {
        for note in &reply.notes {
            eprintln!("{note}");
        }
    }

    Ok(exit_code(reply.return_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api, core::testing::offline_core};
    use tokio::net::TcpListener;

    fn args(server: &str, token_file: &Path, menu: &[&str]) -> Args {
        Args {
            server: server.to_string(),
            token_file: token_file.to_path_buf(),
            diagnostics: false,
            args: menu.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_request_url() {
        let url = request_url(
            "http://localhost:8080",
            &["user".into(), "set".into(), "a/b c".into(), String::new()],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/user/set/a%2Fb%20c/%C2%B6"
        );

        let url = request_url("https://example.org/warden/", &["system".into()]).unwrap();
        assert_eq!(url.as_str(), "https://example.org/warden/api/system");

        assert!(request_url("mailto:ops@example.org", &[]).is_err());
    }

    #[test]
    fn test_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        assert!(read_token(&path).is_none());
        save_token(&path, "abc").unwrap();
        assert_eq!(read_token(&path).as_deref(), Some("abc"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(remove_token(&path).unwrap());
        assert!(!remove_token(&path).unwrap());
    }

    #[tokio::test]
    async fn test_rejected_token_is_removed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = api::router(offline_core().await);
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await;
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        save_token(&path, "stale").unwrap();

        let server = format!("http://{addr}");
        let reply = call(&args(&server, &path, &["system", "whoami"]))
            .await
            .unwrap();

        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert!(!path.exists());
        assert_eq!(reply.notes.len(), 1);

        let reply = call(&args(&server, &path, &["nosuchthing"])).await.unwrap();
        assert_eq!(reply.return_code, 1);
        assert!(reply.notes.is_empty());
    }
}
