//! Unrecoverable misuse.
//!
//! Aborting an irrevocable transaction dies while global locks are held, so
//! that scenario runs in a child process and the parent only inspects the
//! wreckage.

use invalbrid::tx::{self, CodeProperties, Error};
use std::process::Command;

#[test]
#[should_panic(expected = "undo-logging")]
fn undo_log_instrumentation_is_rejected() {
    let props = CodeProperties::INSTRUMENTED_CODE
        | CodeProperties::HAS_NO_ABORT
        | CodeProperties::UNDO_LOG_CODE;
    let _ = tx::transaction(props, |_tx| Ok(()));
}

fn abort_inside_irrevocable() {
    let props = CodeProperties::INSTRUMENTED_CODE
        | CodeProperties::HAS_NO_ABORT
        | CodeProperties::DOES_GO_IRREVOCABLE;
    let _ = tx::transaction(props, |tx| {
        tx.set_irrevocable()?;
        let nested = tx.nested(CodeProperties::INSTRUMENTED_CODE, |_tx| {
            Err::<(), _>(Error::ABORT)
        })?;
        let _ = nested;
        Ok(())
    });
    unreachable!("aborting an irrevocable transaction must be fatal");
}

#[test]
fn aborting_an_irrevocable_transaction_is_fatal() {
    if std::env::var_os("INVALBRID_FATAL_CHILD").is_some() {
        abort_inside_irrevocable();
        return;
    }
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(&[
            "aborting_an_irrevocable_transaction_is_fatal",
            "--nocapture",
            "--test-threads=1",
        ])
        .env("INVALBRID_FATAL_CHILD", "1")
        .output()
        .unwrap();
    assert!(
        !output.status.success(),
        "the child process must not exit cleanly"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stderr.contains("cannot abort an irrevocable transaction")
            || stdout.contains("cannot abort an irrevocable transaction"),
        "unexpected child output:\n{}\n{}",
        stdout,
        stderr
    );
}
