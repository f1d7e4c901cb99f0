use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use ember_process::ServerProfile;
use tokio::process::Command;

pub const SERVER_JAR: &str = "server.jar";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    /// `java -Xms<min>M -Xmx<max>M -jar server.jar nogui` in the profile's
    /// server directory.
    pub fn for_profile(profile: &ServerProfile, java: &Path) -> Self {
        Self {
            exec: java.to_path_buf(),
            args: vec![
                format!("-Xms{}M", profile.ram_min_mb),
                format!("-Xmx{}M", profile.ram_max_mb),
                "-jar".to_string(),
                SERVER_JAR.to_string(),
                "nogui".to_string(),
            ],
            cwd: profile.server_path.clone(),
        }
    }

    /// Command with all three stdio streams piped. On Unix the child leads its
    /// own session, so its pid doubles as the process group id.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.exec);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Terminate the server if the manager dies without stopping it.
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
