//! Logging interface, contingent on the `defmt-03` feature
//!
//! Only enable logging when debugging, and when you're certain that your
//! logger isn't using USB!
//!
//! Without the feature, the arguments are only borrowed, so values that
//! exist for the log don't trip the unused lints.

macro_rules! trace {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::trace!($fmt $(, $arg)*);
        #[cfg(not(feature = "defmt-03"))]
        { $(let _ = &$arg;)* }
    }};
}

macro_rules! debug {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::debug!($fmt $(, $arg)*);
        #[cfg(not(feature = "defmt-03"))]
        { $(let _ = &$arg;)* }
    }};
}

macro_rules! warn {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::warn!($fmt $(, $arg)*);
        #[cfg(not(feature = "defmt-03"))]
        { $(let _ = &$arg;)* }
    }};
}

macro_rules! error {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::error!($fmt $(, $arg)*);
        #[cfg(not(feature = "defmt-03"))]
        { $(let _ = &$arg;)* }
    }};
}
