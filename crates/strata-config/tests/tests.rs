// Integration-test harness for strata-config.
//
// Cargo builds one test binary per `tests/*.rs` file, so all suites live under `tests/suite/`.

mod suite;
