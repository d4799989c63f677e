use taskgate_core::Result;
use taskgate_task::TaskGate;

pub async fn status(gate: &TaskGate) -> Result<()> {
    for root in &gate.settings().project_roots {
        let snapshot = gate.daemons().refresh(root).await?.into_inner();
        println!("{}:", root.display());
        if snapshot.daemons.is_empty() {
            println!("  no daemons running");
            continue;
        }
        for daemon in &snapshot.daemons {
            println!("  {:>8}  {:<8} {}", daemon.pid, daemon.status, daemon.info);
        }
    }
    Ok(())
}

pub async fn stop(gate: &TaskGate, pid: Option<&str>) -> Result<()> {
    for root in &gate.settings().project_roots {
        let message = match pid {
            Some(pid) => gate.daemons().stop_daemon(root, pid).await?,
            None => gate.daemons().stop_daemons(root).await?,
        };
        match message {
            Some(message) => println!("{}: {message}", root.display()),
            None => println!("{}: stop already in progress", root.display()),
        }
    }
    Ok(())
}
