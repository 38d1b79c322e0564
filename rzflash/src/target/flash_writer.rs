//! Built-in RZBoard profiles.
//!
//! The boot ROM announces itself with `please send !` after a reset in SCIF
//! download mode and takes the Flash Writer as S-records. The Flash Writer
//! then answers at a `>` prompt and asks for areas and addresses in hex
//! before each image. All of these take their images as a plain S-record
//! stream.
//!
//! Once the bootloader is installed the board boots into U-Boot. The system
//! image stage stops autoboot, brings up networking (DHCP or a fixed address)
//! and starts `fastboot udp`; the image itself then goes over the network.

use std::net::Ipv4Addr;

use crate::stage::Stage;
use crate::target::{StageProfile, Target, Transfer};

/// Boot ROM banner, also printed by the Flash Writer when it wants an image.
pub const SEND_PROMPT: &str = "please send !";
/// Flash Writer command prompt.
pub const WRITER_PROMPT: &str = ">";
/// U-Boot command prompt.
pub const UBOOT_PROMPT: &str = "=>";
/// Wakes up a prompt-driven console.
pub const ENTER: &str = "\r";
/// U-Boot countdown before it boots the installed system.
pub const AUTOBOOT_PROMPT: &str = "Hit any key to stop autoboot:";
/// Printed by U-Boot once DHCP assigned an address.
pub const DHCP_BOUND: &str = "DHCP client bound";
/// Printed by `fastboot udp`, followed by the board's address.
pub const FASTBOOT_LISTENING: &str = "Listening for fastboot command on ";

/// eMMC boot partition holding BL2 and FIP.
pub const EMMC_BOOT_AREA: &str = "1";
/// Sector and load address of BL2 on eMMC.
pub const EMMC_BL2: (&str, &str) = ("1", "11E00");
/// Sector and load address of FIP on eMMC.
pub const EMMC_FIP: (&str, &str) = ("100", "00000");
/// Program and flash address of BL2 on QSPI.
pub const QSPI_BL2: (&str, &str) = ("11E00", "00000");
/// Program and flash address of FIP on QSPI.
pub const QSPI_FIP: (&str, &str) = ("00000", "1D200");

// Flash Writer input prompts end in ':' ("Please Input : H'" ends in a quote).
const INPUT: &str = ":";
const HEX_INPUT: &str = "H'";
const AREA_SELECT: &str = ">";

fn line(text: &str) -> String {
    format!("{text}\r")
}

/// Built-in profile for `stage` on `target`.
pub fn profile(stage: Stage, target: Target) -> StageProfile {
    match (stage, target) {
        (Stage::WriterBootstrap, _) => StageProfile::new("", SEND_PROMPT),
        (Stage::Bl2, Target::Emmc) => StageProfile::new(ENTER, WRITER_PROMPT)
            .step(line("EM_E"), AREA_SELECT)
            .step(line(EMMC_BOOT_AREA), WRITER_PROMPT)
            .step(line("EM_W"), AREA_SELECT)
            .step(line(EMMC_BOOT_AREA), INPUT)
            .step(line(EMMC_BL2.0), INPUT)
            .step(line(EMMC_BL2.1), SEND_PROMPT),
        (Stage::Fip, Target::Emmc) => StageProfile::new(ENTER, WRITER_PROMPT)
            .step(line("EM_W"), AREA_SELECT)
            .step(line(EMMC_BOOT_AREA), INPUT)
            .step(line(EMMC_FIP.0), INPUT)
            .step(line(EMMC_FIP.1), SEND_PROMPT)
            // Boot from partition 1 with an 8-bit bus.
            .then(line("EM_SECSD"), INPUT)
            .then(line("B1"), INPUT)
            .then(line("2"), WRITER_PROMPT)
            .then(line("EM_SECSD"), INPUT)
            .then(line("B3"), INPUT)
            .then(line("8"), WRITER_PROMPT),
        (Stage::Bl2, Target::Qspi) => StageProfile::new(ENTER, WRITER_PROMPT)
            .step(line("XCS"), "Clear OK?")
            .step(line("y"), WRITER_PROMPT)
            .step(line("XLS2"), HEX_INPUT)
            .step(line(QSPI_BL2.0), HEX_INPUT)
            .step(line(QSPI_BL2.1), SEND_PROMPT),
        (Stage::Fip, Target::Qspi) => StageProfile::new(ENTER, WRITER_PROMPT)
            .step(line("XLS2"), HEX_INPUT)
            .step(line(QSPI_FIP.0), HEX_INPUT)
            .step(line(QSPI_FIP.1), "please send"),
        (Stage::Rootfs, _) => rootfs(None),
    }
}

/// System image profile, with DHCP unless `static_ip` is given.
pub fn rootfs(static_ip: Option<Ipv4Addr>) -> StageProfile {
    let profile = StageProfile::new("", AUTOBOOT_PROMPT).step(line("y"), UBOOT_PROMPT);
    let profile = match static_ip {
        Some(ip) => profile.step(line(&format!("setenv ipaddr {ip}")), UBOOT_PROMPT),
        None => profile.step(line("setenv autoload no; dhcp"), DHCP_BOUND),
    };
    profile
        .step(line("fastboot udp"), FASTBOOT_LISTENING)
        .with_transfer(Transfer::Fastboot)
}
