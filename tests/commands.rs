mod common;

use std::io::Write;

use anyhow::Result;
use common::{run, TestDb, PASSWORD};
use warden::{Config, ErrorKind, Perm};

#[tokio::test]
async fn profile_properties_follow_permissions() -> Result<()> {
    let Some(db) = TestDb::start(Config::new()).await? else {
        return Ok(());
    };
    db.user("root", true).await?;
    db.user("alice", false).await?;
    db.user("bob", false).await?;

    let mut alice = db.ctx("192.0.2.70");
    alice.login("alice", PASSWORD, "").await?;

    // Setting a value twice only changes it once.
    let (out, result) = run(&mut alice, "user set alice affiliation ACME").await;
    result?;
    assert_eq!(out, "Updated affiliation\n");
    let (out, result) = run(&mut alice, "user set alice affiliation ACME").await;
    result?;
    assert_eq!(
        out,
        "Value for affiliation was already set to the requested value\n"
    );
    let (out, result) = run(&mut alice, "user get alice affiliation").await;
    result?;
    assert_eq!(out, "ACME\n");

    // Only sysadmins are offered the sysadmin bit.
    let (_, result) = run(&mut alice, "user set alice sysadmin yes").await;
    assert!(result.is_err());
    let sysadmin: bool = sqlx::query_scalar("SELECT sysadmin FROM member WHERE ident = 'alice'")
        .fetch_one(&db.pool)
        .await?;
    assert!(!sysadmin);

    // Strangers see nothing until they share a group.
    let mut bob = db.ctx("192.0.2.71");
    bob.login("bob", PASSWORD, "").await?;
    let (_, result) = run(&mut bob, "user get alice affiliation").await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Unauthorized);

    let mut root = db.ctx("192.0.2.72");
    root.login("root", PASSWORD, "").await?;
    for line in [
        "group new ops Operations",
        "group nominate ops alice",
        "group nominate ops bob",
        "group state ops alice approved",
        "group state ops bob approved",
    ] {
        let (_, result) = run(&mut root, line).await;
        result?;
    }

    let mut bob = db.ctx("192.0.2.71");
    bob.login("bob", PASSWORD, "").await?;
    let (out, result) = run(&mut bob, "user get alice affiliation").await;
    result?;
    assert_eq!(out, "ACME\n");

    // Viewing is not editing.
    let (_, result) = run(&mut bob, "user set alice affiliation Evil").await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Unauthorized);

    let (out, result) = run(&mut bob, "group list").await;
    result?;
    assert!(out.starts_with("ops"));
    Ok(())
}

#[tokio::test]
async fn system_settings_and_weak_passwords() -> Result<()> {
    let mut dict = tempfile::NamedTempFile::new()?;
    writeln!(dict, "password1234")?;
    writeln!(dict, "letmeinplease")?;

    let config = Config::new().with_weak_dicts(vec![dict.path().to_path_buf()]);
    let Some(db) = TestDb::start(config).await? else {
        return Ok(());
    };
    db.user("root", true).await?;
    db.user("erin", false).await?;

    let mut root = db.ctx("192.0.2.80");
    root.login("root", PASSWORD, "").await?;

    let (out, result) = run(&mut root, "system set name Acme").await;
    result?;
    assert_eq!(out, "Updated name\n");
    assert_eq!(db.core.system().get().name, "Acme");

    let (out, result) = run(&mut root, "system get name").await;
    result?;
    assert_eq!(out, "Acme\n");

    let (_, result) = run(&mut root, "system set pw_enforce yes").await;
    result?;
    assert!(db.core.system().get().pw_enforce);

    let (_, result) = run(&mut root, "system add sysadmin_restrict not-a-prefix").await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
    let (out, result) = run(&mut root, "system add sysadmin_restrict 192.0.2.0/24").await;
    result?;
    assert_eq!(out, "Added 192.0.2.0/24 to sysadmin_restrict\n");

    let mut erin = db.ctx("192.0.2.81");
    erin.login("erin", PASSWORD, "").await?;

    // Regular users cannot configure the system.
    let (_, result) = run(&mut erin, "system set name Mine").await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Unauthorized);

    let line = format!("user password set erin letmeinplease {PASSWORD}");
    let (_, result) = run(&mut erin, &line).await;
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(err.to_string().starts_with("Password Problems encountered"));

    let (_, result) = run(&mut erin, "user password set erin Zx9!long-enough-pass wrong").await;
    assert_eq!(result.unwrap_err().to_string(), "Invalid current password.");

    let line = format!("user password set erin Zx9!long-enough-pass {PASSWORD}");
    let (out, result) = run(&mut erin, &line).await;
    result?;
    assert_eq!(out, "Password updated\n");
    assert!(!erin.is_logged_in());

    let mut erin = db.ctx("192.0.2.81");
    erin.login("erin", "Zx9!long-enough-pass", "").await?;
    Ok(())
}

#[tokio::test]
async fn front_door_rewrites_errors() -> Result<()> {
    let Some(db) = TestDb::start(Config::new()).await? else {
        return Ok(());
    };
    db.user("frank", false).await?;

    let mut anon = db.ctx("192.0.2.90");
    anon.run(vec!["group".into(), "list".into()]).await;
    assert_eq!(anon.return_code(), 1);
    assert_eq!(anon.status(), axum::http::StatusCode::UNAUTHORIZED);
    assert_eq!(anon.buffered(), "An error occurred: Access denied\n");

    let mut anon = db.ctx("192.0.2.90");
    let ok = anon
        .run(vec![
            "system".into(),
            "login".into(),
            "frank".into(),
            "wrong".into(),
        ])
        .await;
    assert!(!ok);
    assert_eq!(anon.buffered(), "An error occurred: Login incorrect\n");

    let mut local = db.local();
    let (out, result) = run(&mut local, "system whoami").await;
    result?;
    assert_eq!(out, "Not authenticated\n");
    Ok(())
}

#[tokio::test]
async fn user_view_needs_a_visible_shared_group() -> Result<()> {
    let Some(db) = TestDb::start(Config::new()).await? else {
        return Ok(());
    };
    db.user("root", true).await?;
    db.user("gina", false).await?;
    db.user("hank", false).await?;

    let mut root = db.ctx("192.0.2.100");
    root.login("root", PASSWORD, "").await?;
    for line in ["group new lab Lab", "group nominate lab gina", "group nominate lab hank"] {
        let (_, result) = run(&mut root, line).await;
        result?;
    }

    // Two nominations see nothing of each other.
    let mut hank = db.ctx("192.0.2.101");
    hank.login("hank", PASSWORD, "").await?;
    let err = hank.select_user("gina", Perm::USER_VIEW).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let (_, result) = run(&mut root, "group state lab gina approved").await;
    result?;

    // One visible side is enough.
    hank.select_user("gina", Perm::USER_VIEW).await?;
    hank.check_perms("gina", Perm::USER_VIEW).await?;
    Ok(())
}

async fn audit_rows(db: &TestDb) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM audit_history")
        .fetch_one(&db.pool)
        .await?)
}

#[tokio::test]
async fn equal_values_are_not_rewritten() -> Result<()> {
    let Some(db) = TestDb::start(Config::new()).await? else {
        return Ok(());
    };
    db.user("root", true).await?;
    db.user("ivan", false).await?;

    let mut root = db.ctx("192.0.2.110");
    root.login("root", PASSWORD, "").await?;
    let before = audit_rows(&db).await?;

    for line in [
        "user set ivan login_attempts 0",
        "user set ivan login_attempts 00",
        "user set ivan hide_email false",
        "user set ivan hide_email off",
    ] {
        let (out, result) = run(&mut root, line).await;
        result?;
        assert!(out.ends_with("was already set to the requested value\n"), "{line}: {out}");
    }
    assert_eq!(audit_rows(&db).await?, before);

    let (out, result) = run(&mut root, "user set ivan login_attempts 3").await;
    result?;
    assert_eq!(out, "Updated login_attempts\n");
    assert_eq!(audit_rows(&db).await?, before + 1);

    let (_, result) = run(&mut root, "user set ivan login_attempts 003").await;
    result?;
    assert_eq!(audit_rows(&db).await?, before + 1);
    Ok(())
}
