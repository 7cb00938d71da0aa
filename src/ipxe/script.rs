//! Boot-script templates. The byte layout is part of the wire contract
//! with the PXE second-stage loader, so the templates are literal text
//! with `{NAME}` placeholders.

const REGISTRATION_TEMPLATE: &str = "#!ipxe\n\
echo Metal Enrollment - Registration Mode\n\
echo Service Tag: {SERVICE_TAG}\n\
kernel {BASE_URL}/images/registration/bzImage init=/nix/store/HASH-nixos-system-registration/init console=ttyS0,115200 console=tty0 enrollment_url={ENROLLMENT_URL}\n\
initrd {BASE_URL}/images/registration/initrd\n\
boot\n";

const MACHINE_TEMPLATE: &str = "#!ipxe\n\
echo Metal Enrollment - Custom Image\n\
echo Service Tag: {SERVICE_TAG}\n\
echo Hostname: {HOSTNAME}\n\
kernel {BASE_URL}/images/machines/{SERVICE_TAG}/bzImage init=/nix/store/HASH-nixos-system-{HOSTNAME}/init console=ttyS0,115200 console=tty0\n\
initrd {BASE_URL}/images/machines/{SERVICE_TAG}/initrd\n\
boot\n";

/// Fallback script for unknown or unprepared machines: boots the
/// registration image, which collects hardware facts and enrolls.
pub fn render_registration(service_tag: &str, base_url: &str, enrollment_url: &str) -> String {
    REGISTRATION_TEMPLATE
        .replace("{SERVICE_TAG}", service_tag)
        .replace("{BASE_URL}", base_url)
        .replace("{ENROLLMENT_URL}", enrollment_url)
}

/// Machine-specific script pointing at the published artifact tree.
pub fn render_machine(service_tag: &str, hostname: &str, base_url: &str) -> String {
    MACHINE_TEMPLATE
        .replace("{SERVICE_TAG}", service_tag)
        .replace("{HOSTNAME}", hostname)
        .replace("{BASE_URL}", base_url)
}
