//! Process helpers shared by the supervisor and the runtime client.

/// Check if a process is alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Null signal: existence check only.
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(nix::Error::ESRCH) => false,
            Err(nix::Error::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}

/// Current process ID.
pub fn current_pid() -> u32 {
    std::process::id()
}
