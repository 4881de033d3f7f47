use std::sync::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    /// Held by every test that reads or changes the process working directory.
    pub(crate) static ref CWD_LOCK: Mutex<()> = Mutex::new(());
}
