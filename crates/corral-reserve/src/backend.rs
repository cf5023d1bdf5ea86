//! Node backends: PXE install/uninstall and power control.
//!
//! The TFTP backend writes pxelinux configs directly under the TFTP
//! root; the Cobbler backend drives the `cobbler` CLI instead. Both
//! write the per-reservation master file whose presence is the
//! "installed" indicator the housekeeper checks.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::Command;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::reservation::Reservation;

/// Installs and tears down boot configuration for reservations.
pub trait Backend {
    /// Write PXE config and stage boot assets for an activating
    /// reservation.
    fn install(&self, r: &Reservation) -> Result<()>;

    /// Remove everything [`Backend::install`] created.
    fn uninstall(&self, r: &Reservation) -> Result<()>;

    /// Power the given hosts on or off, one at a time.
    fn power(&self, hosts: &[String], on: bool) -> Result<()>;
}

/// Pick the backend the config asks for.
pub fn backend_for(config: &Config) -> Box<dyn Backend> {
    if config.use_cobbler {
        Box::new(CobblerBackend {
            config: config.clone(),
        })
    } else {
        Box::new(TftpBackend {
            config: config.clone(),
        })
    }
}

// ============================================================================
// TFTP backend
// ============================================================================

/// Writes pxelinux configs and boot images straight into the TFTP tree.
pub struct TftpBackend {
    config: Config,
}

impl TftpBackend {
    /// The pxelinux config content booting this reservation's kernel.
    fn pxe_config(&self, r: &Reservation) -> String {
        format!(
            "default {name}\n\
             label {name}\n\
             kernel /corral/{name}-kernel\n\
             append initrd=/corral/{name}-initrd {args}\n",
            name = r.name,
            args = r.kernel_args,
        )
    }

    /// Per-host pxelinux filename: the host's IPv4 address in
    /// uppercase hex, under `pxelinux.cfg/`.
    fn host_config_path(&self, host: &str) -> Result<PathBuf> {
        let ip = resolve_ipv4(host)?;
        let [a, b, c, d] = ip.octets();
        Ok(self
            .config
            .tftp_root
            .join("pxelinux.cfg")
            .join(format!("{:02X}{:02X}{:02X}{:02X}", a, b, c, d)))
    }

    fn staged_kernel(&self, r: &Reservation) -> PathBuf {
        self.config.state_dir().join(format!("{}-kernel", r.name))
    }

    fn staged_initrd(&self, r: &Reservation) -> PathBuf {
        self.config.state_dir().join(format!("{}-initrd", r.name))
    }
}

impl Backend for TftpBackend {
    fn install(&self, r: &Reservation) -> Result<()> {
        let kernel = r
            .kernel
            .as_ref()
            .ok_or_else(|| Error::backend("install", format!("{} has no kernel", r.name)))?;
        let initrd = r
            .initrd
            .as_ref()
            .ok_or_else(|| Error::backend("install", format!("{} has no initrd", r.name)))?;

        std::fs::create_dir_all(self.config.pxe_dir())
            .map_err(|e| Error::backend("install", e.to_string()))?;

        std::fs::copy(kernel, self.staged_kernel(r))
            .map_err(|e| Error::backend("install", format!("stage kernel: {}", e)))?;
        std::fs::copy(initrd, self.staged_initrd(r))
            .map_err(|e| Error::backend("install", format!("stage initrd: {}", e)))?;

        let content = self.pxe_config(r);

        for host in &r.hosts {
            let path = self.host_config_path(host)?;
            std::fs::write(&path, &content)
                .map_err(|e| Error::backend("install", format!("{}: {}", path.display(), e)))?;
        }

        // The master copy goes last: its presence means "installed",
        // so a partial install is retried next invocation.
        std::fs::write(r.pxe_filename(&self.config), &content)
            .map_err(|e| Error::backend("install", e.to_string()))?;

        tracing::info!(reservation = %r.name, hosts = r.hosts.len(), "pxe config installed");
        Ok(())
    }

    fn uninstall(&self, r: &Reservation) -> Result<()> {
        for host in &r.hosts {
            match self.host_config_path(host) {
                Ok(path) => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(host = %host, error = %e, "pxe config not removed");
                        }
                    }
                }
                Err(e) => tracing::warn!(host = %host, error = %e, "pxe config not removed"),
            }
        }

        for path in [
            r.pxe_filename(&self.config),
            self.staged_kernel(r),
            self.staged_initrd(r),
        ] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "not removed");
                }
            }
        }

        Ok(())
    }

    fn power(&self, hosts: &[String], on: bool) -> Result<()> {
        power_hosts(&self.config, hosts, on)
    }
}

// ============================================================================
// Cobbler backend
// ============================================================================

/// Drives node boot config through the `cobbler` CLI.
pub struct CobblerBackend {
    config: Config,
}

impl CobblerBackend {
    fn profile_name(&self, r: &Reservation) -> String {
        match &r.pxe_profile {
            Some(profile) => profile.clone(),
            None => format!("corral_{}", r.name),
        }
    }
}

impl Backend for CobblerBackend {
    fn install(&self, r: &Reservation) -> Result<()> {
        // A raw kernel/initrd reservation gets its own distro+profile;
        // a profile reservation boots an existing one.
        if r.pxe_profile.is_none() {
            let kernel = r
                .kernel
                .as_ref()
                .ok_or_else(|| Error::backend("install", format!("{} has no kernel", r.name)))?;
            let initrd = r
                .initrd
                .as_ref()
                .ok_or_else(|| Error::backend("install", format!("{} has no initrd", r.name)))?;

            run_checked(Command::new("cobbler").args([
                "distro",
                "add",
                &format!("--name=corral_{}", r.name),
                &format!("--kernel={}", kernel.display()),
                &format!("--initrd={}", initrd.display()),
                &format!("--kopts={}", r.kernel_args),
            ]))?;
            run_checked(Command::new("cobbler").args([
                "profile",
                "add",
                &format!("--name=corral_{}", r.name),
                &format!("--distro=corral_{}", r.name),
            ]))?;
        }

        let profile = self.profile_name(r);
        for host in &r.hosts {
            run_checked(Command::new("cobbler").args([
                "system",
                "edit",
                &format!("--name={}", host),
                &format!("--profile={}", profile),
                "--netboot-enabled=true",
            ]))?;
        }

        std::fs::create_dir_all(self.config.pxe_dir())
            .map_err(|e| Error::backend("install", e.to_string()))?;
        std::fs::write(r.pxe_filename(&self.config), format!("{}\n", profile))
            .map_err(|e| Error::backend("install", e.to_string()))?;

        tracing::info!(reservation = %r.name, profile = %profile, "cobbler install done");
        Ok(())
    }

    fn uninstall(&self, r: &Reservation) -> Result<()> {
        for host in &r.hosts {
            let res = run_checked(Command::new("cobbler").args([
                "system",
                "edit",
                &format!("--name={}", host),
                &format!("--profile={}", self.config.cobbler_default_profile),
                "--netboot-enabled=false",
            ]));
            if let Err(e) = res {
                tracing::warn!(host = %host, error = %e, "cobbler reset failed");
            }
        }

        if r.pxe_profile.is_none() {
            for kind in ["profile", "distro"] {
                let res = run_checked(Command::new("cobbler").args([
                    kind,
                    "remove",
                    &format!("--name=corral_{}", r.name),
                ]));
                if let Err(e) = res {
                    tracing::warn!(reservation = %r.name, error = %e, "cobbler cleanup failed");
                }
            }
        }

        if let Err(e) = std::fs::remove_file(r.pxe_filename(&self.config)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(reservation = %r.name, error = %e, "marker not removed");
            }
        }

        Ok(())
    }

    fn power(&self, hosts: &[String], on: bool) -> Result<()> {
        power_hosts(&self.config, hosts, on)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Run the configured printf-style power command once per host.
fn power_hosts(config: &Config, hosts: &[String], on: bool) -> Result<()> {
    let template = if on {
        &config.power_on_command
    } else {
        &config.power_off_command
    };

    if template.is_empty() {
        return Err(Error::backend(
            "power",
            "no power command configured".to_string(),
        ));
    }

    for host in hosts {
        let cmdline = template.replace("%s", host);
        let mut parts = cmdline.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::backend("power", "empty power command".to_string()))?;

        run_checked(Command::new(program).args(parts))?;
        tracing::info!(host = %host, on, "powered");
    }

    Ok(())
}

/// Run a command, mapping nonzero exit to an error carrying stderr.
fn run_checked(cmd: &mut Command) -> Result<()> {
    let rendered = format!("{:?}", cmd);
    let output = cmd
        .output()
        .map_err(|e| Error::backend("exec", format!("{}: {}", rendered, e)))?;

    if !output.status.success() {
        return Err(Error::backend(
            "exec",
            format!(
                "{}: {}",
                rendered,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    Ok(())
}

/// Resolve a host name to its IPv4 address via the system resolver.
fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| Error::backend("resolve", format!("{}: {}", host, e)))?;

    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Ok(v4);
        }
    }

    Err(Error::backend(
        "resolve",
        format!("{}: no ipv4 address", host),
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records backend calls instead of touching TFTP or power.
    /// Install still writes the marker file so housekeeping sees the
    /// "installed" indicator.
    #[derive(Default)]
    pub struct FakeBackend {
        pub config: Config,
        pub installed: Mutex<Vec<String>>,
        pub uninstalled: Mutex<Vec<String>>,
        pub powered: Mutex<Vec<(Vec<String>, bool)>>,
        pub fail_install: bool,
    }

    impl Backend for FakeBackend {
        fn install(&self, r: &Reservation) -> Result<()> {
            if self.fail_install {
                return Err(Error::backend("install", "boom"));
            }
            std::fs::create_dir_all(self.config.pxe_dir())?;
            std::fs::write(r.pxe_filename(&self.config), &r.name)?;
            self.installed.lock().unwrap().push(r.name.clone());
            Ok(())
        }

        fn uninstall(&self, r: &Reservation) -> Result<()> {
            let _ = std::fs::remove_file(r.pxe_filename(&self.config));
            self.uninstalled.lock().unwrap().push(r.name.clone());
            Ok(())
        }

        fn power(&self, hosts: &[String], on: bool) -> Result<()> {
            self.powered.lock().unwrap().push((hosts.to_vec(), on));
            Ok(())
        }
    }
}
