use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rustc-env=FAREGATE_BUILD_DATE_UTC={}", build_date_utc());
}

// Stamp the binary with its UTC build date; "unknown" when `date` is not
// usable on the build host.
fn build_date_utc() -> String {
    let stdout = match Command::new("date").args(["-u", "+%Y-%m-%dT%H:%M:%SZ"]).output() {
        Ok(output) if output.status.success() => output.stdout,
        _ => return "unknown".to_owned(),
    };

    match String::from_utf8(stdout) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_owned(),
        _ => "unknown".to_owned(),
    }
}
