//! Provisioning steps and the resources each one manages.
//!
//! Template paths are relative to the resource root; every template may
//! also be shipped with a `.template` suffix.

mod always;
mod one_time;

use appliance_config::ApplianceConfig;

use crate::environment::Environment;
use crate::exec::Cmd;
use crate::installer::{FollowUp, Resource};
use crate::services::{Activation, ServiceAction};
use crate::template::Placeholder;

pub const BOOT_CONFIG: &str = "Boot configuration";

/// Boot firmware configuration. A change here needs a reboot to apply.
pub fn boot_config(config: &ApplianceConfig) -> Resource {
    Resource::new(BOOT_CONFIG, "boot/config.txt", &config.install.boot_config)
}

pub fn mdns(config: &ApplianceConfig) -> Vec<Resource> {
    let name = &config.appliance.name;
    vec![
        Resource::new("Hosts file", "network/hosts", "/etc/hosts")
            .require(&[Placeholder::Hostname]),
        Resource::new(
            "mDNS advertisement",
            "network/avahi.service",
            format!("/etc/avahi/services/{name}.service"),
        )
        .require(&[Placeholder::Hostname])
        .then(FollowUp::Service(ServiceAction::new(
            "avahi-daemon",
            Activation::Restart,
        ))),
    ]
}

pub fn usb_automount(config: &ApplianceConfig) -> Vec<Resource> {
    let name = &config.appliance.name;
    vec![
        Resource::new(
            "Automount script",
            "usb/automount.sh",
            format!("/usr/local/bin/{name}-automount"),
        )
        .mode(0o755),
        Resource::new(
            "Automount unit",
            "usb/automount@.service",
            format!("/etc/systemd/system/{name}-automount@.service"),
        )
        .require(&[Placeholder::Appliance])
        .then(FollowUp::DaemonReload),
        Resource::new(
            "Automount rules",
            "usb/automount.rules",
            format!("/etc/udev/rules.d/99-{name}-automount.rules"),
        )
        .require(&[Placeholder::Appliance])
        .then(FollowUp::Run(
            Cmd::new("udevadm")
                .args(["control", "--reload-rules"])
                .elevated(),
        ))
        .then(FollowUp::Run(
            Cmd::new("udevadm")
                .args(["trigger", "--subsystem-match=block"])
                .elevated(),
        )),
    ]
}

pub fn audio(config: &ApplianceConfig) -> Vec<Resource> {
    let unit = format!("{}-audio.service", config.appliance.name);
    vec![
        Resource::new("ALSA configuration", "audio/asound.conf", "/etc/asound.conf"),
        systemd_unit("Audio service", "audio/audio.service", &unit)
            .require(&[Placeholder::User, Placeholder::PythonRoot]),
    ]
}

pub fn spotify(config: &ApplianceConfig, env: &Environment) -> Vec<Resource> {
    let unit = format!("{}-spotify.service", config.appliance.name);
    vec![
        Resource::new(
            "Spotify bridge configuration",
            "spotify/spotifyd.conf",
            env.spotify_root.join("spotifyd.conf"),
        )
        .user_owned()
        .mode(0o600),
        systemd_unit("Spotify bridge service", "spotify/spotify.service", &unit)
            .require(&[Placeholder::User, Placeholder::SpotifyRoot]),
    ]
}

pub fn autostart(config: &ApplianceConfig) -> Resource {
    let unit = format!("{}.service", config.appliance.name);
    systemd_unit("Autostart service", "autostart/autostart.service", &unit).require(&[
        Placeholder::User,
        Placeholder::InstallRoot,
        Placeholder::PythonRoot,
    ])
}

/// A unit under /etc/systemd/system that is reloaded, enabled and
/// restarted whenever it changes.
fn systemd_unit(name: &str, template: &str, unit: &str) -> Resource {
    Resource::new(name, template, format!("/etc/systemd/system/{unit}"))
        .then(FollowUp::DaemonReload)
        .then(FollowUp::Service(ServiceAction::new(
            unit,
            Activation::EnableAndRestart,
        )))
}
