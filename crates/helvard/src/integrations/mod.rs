#[cfg(feature = "integration_helvar")]
pub mod helvar;
