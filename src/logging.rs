//! Logging setup.
//!
//! The engines log through the `log` facade only. Embedders usually install
//! their own logger; services that run under systemd can opt into the
//! `journald` feature and forward everything to the journal instead.

/// Install a process-wide journald logger at `level`.
///
/// Does nothing unless the crate is built with the `journald` feature.
/// Installation failures are reported on stderr rather than propagated, so
/// a missing journal socket never stops the client from running.
pub fn init_journald_logger(level: log::LevelFilter) {
    #[cfg(feature = "journald")]
    {
        match systemd_journal_logger::JournalLog::new() {
            Ok(journal) => {
                if let Err(e) = journal.install() {
                    eprintln!("cannot install journald logger: {e}");
                    return;
                }
                log::set_max_level(level);
                log::debug!("logging to the journal at {level}");
            }
            Err(e) => eprintln!("cannot open the journal: {e}"),
        }
    }
    #[cfg(not(feature = "journald"))]
    let _ = level;
}
