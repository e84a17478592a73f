pub(crate) mod helpers;

mod tests_modes;
