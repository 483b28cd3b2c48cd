//! Validation of discharge and network settings.

use korad_daq::config::Settings;

fn rejected_with(settings: &Settings, fragment: &str) {
    let result = settings.validate();
    assert!(result.is_err(), "expected '{fragment}' to be rejected");
    let err_msg = result.unwrap_err().to_string();
    assert!(err_msg.contains(fragment), "message was: {err_msg}");
}

#[test]
fn test_negative_set_current_rejected() {
    let mut settings = Settings::default();
    settings.discharge.set_current = -1.0;
    rejected_with(&settings, "set_current must be a positive number");
}

#[test]
fn test_nan_voltage_cutoff_rejected() {
    let mut settings = Settings::default();
    settings.discharge.voltage_cutoff = f64::NAN;
    rejected_with(&settings, "voltage_cutoff must be a positive number");
}

#[test]
fn test_infinite_capacity_cutoff_rejected() {
    let mut settings = Settings::default();
    settings.discharge.capacity_cutoff = f64::INFINITY;
    rejected_with(&settings, "capacity_cutoff must be a positive number");
}

#[test]
fn test_zero_time_cutoff_rejected() {
    let mut settings = Settings::default();
    settings.discharge.time_cutoff = 0.0;
    rejected_with(&settings, "time_cutoff must be a positive number");
}

#[test]
fn test_empty_cell_id_rejected() {
    let mut settings = Settings::default();
    settings.discharge.cell_id = "  ".into();
    rejected_with(&settings, "cell_id must not be empty");
}

#[test]
fn test_zero_sampling_period_rejected() {
    let mut settings = Settings::default();
    settings.discharge.sampling_period_ms = 0;
    rejected_with(&settings, "sampling_period_ms");
}

#[test]
fn test_profile_slot_out_of_range_rejected() {
    let mut settings = Settings::default();
    settings.discharge.profile_slot = 10;
    rejected_with(&settings, "profile_slot 10 out of range");
}

#[test]
fn test_zero_disable_attempts_rejected() {
    let mut settings = Settings::default();
    settings.discharge.disable_attempts = 0;
    rejected_with(&settings, "disable_attempts");
}

#[test]
fn test_zero_attempt_timeout_rejected() {
    let mut settings = Settings::default();
    settings.network.attempt_timeout_ms = 0;
    rejected_with(&settings, "attempt_timeout_ms must be greater than 0");
}

#[test]
fn test_unknown_log_format_rejected() {
    let mut settings = Settings::default();
    settings.application.log_format = "xml".into();
    rejected_with(&settings, "Invalid log_format 'xml'");
}

#[test]
fn test_hostname_instead_of_ip_rejected() {
    let mut settings = Settings::default();
    settings.network.local_address = "localhost".into();
    rejected_with(&settings, "Invalid local_address 'localhost'");
}

#[test]
fn test_ipv6_device_accepted() {
    let mut settings = Settings::default();
    settings.network.local_address = "::".into();
    settings.network.device_address = "::1".into();

    assert!(settings.validate().is_ok());
    assert_eq!(settings.device_addr().unwrap().to_string(), "[::1]:18190");
}

#[test]
fn test_current_equal_to_range_accepted() {
    let mut settings = Settings::default();
    settings.discharge.set_current = settings.discharge.max_current;
    assert!(settings.validate().is_ok());
}
