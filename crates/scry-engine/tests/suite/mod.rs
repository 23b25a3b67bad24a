// Scenario suites, compiled into the single `tests` binary.
mod breakpoints;
mod lifecycle;
mod stepping;
mod values;
