//! Check-in executor that runs an external automation program.
//!
//! The program receives the reservation as JSON on stdin and reports back
//! through its exit status:
//!
//! - `0`: checked in; stdout holds the boarding document (may be empty)
//! - `75` (`EX_TEMPFAIL`): transient failure, worth retrying
//! - anything else: the airline refused; stderr says why

use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use checkin_scheduler::{AttemptOutcome, BoardingInfo, CheckInExecutor, Reservation};

/// Exit status for transient failures.
pub const EXIT_TEMPFAIL: i32 = 75;

/// What the automation program reads on stdin.
#[derive(Debug, Serialize)]
struct AttemptRequest<'a> {
    confirmation_number: &'a str,
    first_name: &'a str,
    last_name: &'a str,
    departure: DateTime<FixedOffset>,
    attempt: u32,
}

impl<'a> From<&'a Reservation> for AttemptRequest<'a> {
    fn from(reservation: &'a Reservation) -> Self {
        Self {
            confirmation_number: &reservation.confirmation_number,
            first_name: &reservation.traveler.first_name,
            last_name: &reservation.traveler.last_name,
            departure: reservation.departure,
            attempt: reservation.attempt_count,
        }
    }
}

/// Runs one program invocation per check-in attempt.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn invoke(&self, input: &[u8]) -> std::io::Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out attempt drops this future; take the child with it
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit without reading its input
            if let Err(e) = stdin.write_all(input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e);
                }
            }
            drop(stdin);
        }

        child.wait_with_output().await
    }
}

#[async_trait]
impl CheckInExecutor for CommandExecutor {
    async fn attempt(&self, reservation: &Reservation) -> AttemptOutcome {
        let input = match serde_json::to_vec(&AttemptRequest::from(reservation)) {
            Ok(input) => input,
            Err(e) => {
                return AttemptOutcome::PermanentFailure(format!(
                    "failed to encode reservation: {e}"
                ));
            }
        };

        debug!(
            program = %self.program.display(),
            reservation = %reservation.id,
            attempt = reservation.attempt_count,
            "running check-in program"
        );

        match self.invoke(&input).await {
            Ok(output) => classify(output.status.code(), &output.stdout, &output.stderr),
            Err(e) => {
                warn!(
                    program = %self.program.display(),
                    error = %e,
                    "failed to run check-in program"
                );
                AttemptOutcome::RetryableFailure(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            }
        }
    }
}

/// Map a finished invocation to an attempt outcome.
fn classify(code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> AttemptOutcome {
    match code {
        Some(0) => {
            let stdout = String::from_utf8_lossy(stdout);
            if stdout.trim().is_empty() {
                return AttemptOutcome::Success(BoardingInfo::default());
            }
            match serde_json::from_str::<BoardingInfo>(&stdout) {
                Ok(boarding) => AttemptOutcome::Success(boarding),
                // Safe to retry: a repeated attempt reports the existing check-in
                Err(e) => AttemptOutcome::RetryableFailure(format!(
                    "unreadable boarding document: {e}"
                )),
            }
        }
        Some(EXIT_TEMPFAIL) => {
            AttemptOutcome::RetryableFailure(reason(stderr, "temporary failure"))
        }
        Some(code) => {
            AttemptOutcome::PermanentFailure(reason(stderr, &format!("exit status {code}")))
        }
        None => AttemptOutcome::RetryableFailure("terminated by signal".to_string()),
    }
}

/// Last non-empty stderr line, or `fallback`.
fn reason(stderr: &[u8], fallback: &str) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkin_scheduler::Traveler;
    use test_case::test_case;

    fn reservation() -> Reservation {
        Reservation::new(
            "ABC123",
            Traveler {
                first_name: "Jane".to_string(),
                last_name: "Doe".to_string(),
            },
            (chrono::Utc::now() + chrono::Duration::hours(2)).fixed_offset(),
            chrono::Duration::hours(24),
        )
    }

    #[test_case(Some(75), b"", "temporary failure" ; "tempfail without stderr")]
    #[test_case(Some(75), b"503 from airline\n\n", "503 from airline" ; "tempfail with stderr")]
    #[test_case(None, b"", "terminated by signal" ; "killed")]
    fn test_classify_retryable(code: Option<i32>, stderr: &[u8], expected: &str) {
        assert_eq!(
            classify(code, b"", stderr),
            AttemptOutcome::RetryableFailure(expected.to_string())
        );
    }

    #[test_case(Some(1), b"", "exit status 1" ; "bare failure")]
    #[test_case(Some(2), b"warming up\nconfirmation number not found\n", "confirmation number not found" ; "last stderr line")]
    fn test_classify_permanent(code: Option<i32>, stderr: &[u8], expected: &str) {
        assert_eq!(
            classify(code, b"", stderr),
            AttemptOutcome::PermanentFailure(expected.to_string())
        );
    }

    #[test]
    fn test_classify_success_parses_boarding() {
        let stdout = br#"{"passes": [{"passenger": "Jane Doe", "flight_number": "WN100", "group": "A", "position": 12}]}"#;
        let AttemptOutcome::Success(boarding) = classify(Some(0), stdout, b"") else {
            panic!("expected success");
        };
        assert_eq!(boarding.passes.len(), 1);
        assert_eq!(boarding.passes[0].group, "A");
        assert_eq!(boarding.passes[0].position, 12);
    }

    #[test]
    fn test_classify_success_without_document() {
        assert_eq!(
            classify(Some(0), b"  \n", b""),
            AttemptOutcome::Success(BoardingInfo::default())
        );
    }

    #[test]
    fn test_classify_unreadable_document_is_retryable() {
        assert!(matches!(
            classify(Some(0), b"<html>oops</html>", b""),
            AttemptOutcome::RetryableFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_retryable() {
        let executor = CommandExecutor::new("/nonexistent/checkin-bot", Vec::new());
        assert!(matches!(
            executor.attempt(&reservation()).await,
            AttemptOutcome::RetryableFailure(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_reads_reservation_from_stdin() {
        // Echo the confirmation number back as the passenger name
        let script = r#"
            input=$(cat)
            case "$input" in
                *'"confirmation_number":"ABC123"'*) ;;
                *) echo "unexpected input: $input" >&2; exit 1 ;;
            esac
            echo '{"passes": [{"passenger": "Jane Doe", "group": "B", "position": 7}]}'
        "#;
        let executor = CommandExecutor::new("sh", vec!["-c".to_string(), script.to_string()]);

        let AttemptOutcome::Success(boarding) = executor.attempt(&reservation()).await else {
            panic!("expected success");
        };
        assert_eq!(boarding.passes[0].group, "B");
        assert_eq!(boarding.passes[0].position, 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_tempfail_exit_is_retryable() {
        let executor = CommandExecutor::new(
            "sh",
            vec![
                "-c".to_string(),
                "cat >/dev/null; echo 'airline busy' >&2; exit 75".to_string(),
            ],
        );

        assert_eq!(
            executor.attempt(&reservation()).await,
            AttemptOutcome::RetryableFailure("airline busy".to_string())
        );
    }
}
