pub mod config;
pub mod dispatcher;
pub mod hal;
pub mod messages;
pub mod motion;
pub mod protocol;
pub mod runtime;

#[cfg(test)]
pub(crate) mod test_support;
