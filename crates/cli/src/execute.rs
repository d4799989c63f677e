use crate::commands::{daemons, run, tasks, Commands};
use taskgate_core::Result;
use taskgate_task::TaskGate;

impl Commands {
    /// Run the command against a started gate and return the process exit code.
    pub async fn execute(self, gate: &TaskGate) -> Result<i32> {
        gate.start().await?;

        match self {
            Commands::Tasks { verbose } => tasks::execute(gate, verbose).await.map(|()| 0),
            Commands::Run {
                task,
                args,
                debug_task,
            } => run::execute(gate, &task, &args, debug_task).await,
            Commands::Daemons => daemons::status(gate).await.map(|()| 0),
            Commands::StopDaemons { pid } => daemons::stop(gate, pid.as_deref()).await.map(|()| 0),
        }
    }
}
