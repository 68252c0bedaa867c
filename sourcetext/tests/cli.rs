use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::fs::write;
use tempfile::{tempdir, TempDir};

/// A temp dir holding a config that points the store at a database inside it.
fn workspace() -> TempDir {
    let dir = tempdir().expect("Creating temp dir failed");
    let config = format!(
        "store:\n  kind: sqlite\n  path: {}\n",
        dir.path().join("texts.db").display()
    );
    write(dir.path().join("config.yaml"), config).expect("Writing temp config failed");
    dir
}

fn sourcetext(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sourcetext").expect("Binary exists");
    cmd.arg("--config")
        .arg(dir.path().join("config.yaml"))
        .env_remove("SOURCETEXT_DATABASE")
        .current_dir(dir.path());
    cmd
}

#[test]
#[serial]
fn import_prints_annotated_document_and_units_lists_them() {
    let dir = workspace();
    write(dir.path().join("page.html"), "<p>A</p><p>B</p>").unwrap();

    sourcetext(&dir)
        .args(["import", "page.html", "--slug", "page", "--owner", "alice", "--title", "Page"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("data-source-text-id")
                .and(predicate::str::contains("\"slug\": \"page\""))
                .and(predicate::str::contains("\"inserted\": 3")),
        );

    sourcetext(&dir)
        .args(["units", "page"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"text\": \"Page\"")
                .and(predicate::str::contains("\"text\": \"B\""))
                .and(predicate::str::contains("\"number\": 2")),
        );
}

#[test]
#[serial]
fn reimport_of_identical_file_inserts_nothing() {
    let dir = workspace();
    write(dir.path().join("page.md"), "# Title\n\nBody text.\n").unwrap();

    for expected in ["\"inserted\": 2", "\"inserted\": 0"] {
        sourcetext(&dir)
            .args(["import", "page.md", "--slug", "page", "--owner", "alice"])
            .assert()
            .success()
            .stdout(predicate::str::contains(expected));
    }
}

#[test]
#[serial]
fn bulk_import_reports_each_document() {
    let dir = workspace();
    write(dir.path().join("one.html"), "<p>One</p>").unwrap();
    write(dir.path().join("two.md"), "Two\n").unwrap();
    write(
        dir.path().join("manifest.yaml"),
        "documents:\n  - slug: one\n    owner: alice\n    path: one.html\n  - slug: two\n    owner: bob\n    path: two.md\n",
    )
    .unwrap();

    sourcetext(&dir)
        .args(["bulk-import", "manifest.yaml", "--concurrency", "2"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"slug\": \"one\"")
                .and(predicate::str::contains("\"slug\": \"two\""))
                .and(predicate::str::contains("\"ok\": false").not()),
        );
}

#[test]
#[serial]
fn units_for_unknown_slug_fails() {
    let dir = workspace();
    sourcetext(&dir)
        .args(["units", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No document with slug"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

#[tokio::test]
#[serial]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use sourcetext::cli::{run, Cli, Commands};

    // The config path does not exist, so run fails right after the event.
    let cli = Cli {
        config: Some(std::path::PathBuf::from("does-not-exist.yaml")),
        command: Commands::Units {
            slug: "anything".to_string(),
        },
    };
    assert!(run(cli).await.is_err());

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
