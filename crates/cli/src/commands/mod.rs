use clap::Subcommand;

pub mod daemons;
pub mod run;
pub mod tasks;

#[derive(Subcommand)]
pub enum Commands {
    /// List the tasks the build server reports for every project root
    #[command(visible_alias = "ls")]
    Tasks {
        /// Show group and description for each task
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run a task and stream its output
    #[command(visible_alias = "r")]
    Run {
        /// Task path (`build`) or script path (`:app:build`)
        task: String,

        /// Arguments passed through to the task
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Run the task with debugging enabled
        #[arg(long)]
        debug_task: bool,
    },

    /// Show build daemon status for every project root
    Daemons,

    /// Ask the build server to stop its daemons
    StopDaemons {
        /// Stop a single daemon by process id
        #[arg(long)]
        pid: Option<String>,
    },
}
