use taskgate_core::{Error, Result};
use taskgate_task::{RunOutcome, TaskGate};

/// Run a task, cancelling it on Ctrl-C. Returns the exit code to report.
pub async fn execute(gate: &TaskGate, task: &str, args: &[String], debug: bool) -> Result<i32> {
    let definition = gate.resolve(task).await?;
    let args = shlex::try_join(args.iter().map(String::as_str))
        .map_err(|e| Error::configuration(format!("cannot quote task arguments: {e}")))?;

    let run = gate.run(&definition, &args, debug);
    tokio::pin!(run);

    let outcome = tokio::select! {
        outcome = &mut run => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling {}...", definition.script_path);
            gate.runner().cancel(&definition.identity).await?;
            run.await?
        }
    };

    match outcome {
        RunOutcome::Completed { exit_code, .. } => {
            let code = exit_code.unwrap_or(0);
            if code != 0 {
                eprintln!("{} failed with exit code {code}", definition.script_path);
            }
            Ok(code)
        }
        RunOutcome::Cancelled { .. } => {
            eprintln!("{} was cancelled", definition.script_path);
            Ok(130)
        }
        RunOutcome::AlreadyRunning => {
            eprintln!("{} is already running", definition.script_path);
            Ok(1)
        }
    }
}
