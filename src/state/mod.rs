//! Persisted sync state: the committed state file, the append-only journal,
//! and the per-channel advisory lock.
//!
//! The state file holds one header line (`UVm:MUm UVs:Xs:MUs`) and one line
//! per live record (`UIDm UIDs [X]FLAGS`). The journal records intended
//! mutations since the last commit; it is replayed on startup when the
//! previous run died before renaming `state.new` over `state`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, LineWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::config::{ChannelConfig, FsyncLevel, SyncSettings};
use crate::errors::{LockError, StateError};
use crate::types::{Flags, Pair, Side, Tuid, UidSlot};

pub const JOURNAL_VERSION: &str = "2";

/// The persistent pairing atom: one message identity across both sides.
#[derive(Debug, Clone, Default)]
pub struct SyncRec {
    pub uid: Pair<UidSlot>,
    /// Last-known synchronized flag set.
    pub flags: Flags,
    /// Logically removed; omitted from the next state file.
    pub dead: bool,
    /// Handled during this run; later phases skip it.
    pub done: bool,
    /// The message is deleted (or gone) on this side.
    pub del: Pair<bool>,
    /// Expiration intent journaled but not yet confirmed on the slave.
    pub expire: bool,
    /// Expiration confirmed; the slave copy is gone for good.
    pub expired: bool,
    /// This run's expiration verdict.
    pub nexpire: bool,
    /// Expired and no longer present on the slave.
    pub exp_orphan: bool,
    /// Index of the paired message per side, for this run.
    pub msg: Pair<Option<usize>>,
    /// Flag additions to apply per side.
    pub aflags: Pair<Flags>,
    /// Flag removals to apply per side.
    pub dflags: Pair<Flags>,
}

impl SyncRec {
    pub fn new(uid: Pair<UidSlot>) -> SyncRec {
        SyncRec {
            uid,
            ..SyncRec::default()
        }
    }

    pub fn live(&self) -> bool {
        !self.dead
    }

    /// The journaled expire intent differs from the confirmed state.
    pub fn expire_transition(&self) -> bool {
        self.expire != self.expired
    }
}

/// Locations of the persisted files for one channel/box pairing.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state: PathBuf,
    pub new: PathBuf,
    pub journal: PathBuf,
    pub lock: PathBuf,
}

fn clean_name(name: &str) -> String {
    name.replace('/', "!")
}

impl StatePaths {
    /// Resolve where this channel keeps its state, creating the directory
    /// when needed.
    pub fn resolve(
        chan: &ChannelConfig,
        settings: &SyncSettings,
        slave_path: Option<&Path>,
        names: Pair<&str>,
    ) -> Result<StatePaths, StateError> {
        let effective = chan.sync_state(settings);
        let state: PathBuf = if effective == "*" {
            let base = slave_path
                .ok_or_else(|| StateError::NoInBoxState(chan.stores.slave.name.clone()))?;
            base.join(concat!(".", env!("CARGO_PKG_NAME"), "state"))
        } else {
            let name = match &chan.sync_state {
                Some(prefix) => format!("{}{}", prefix, clean_name(names.slave)),
                None => format!(
                    "{}:{}:{}_:{}:{}",
                    settings.sync_state,
                    chan.stores.master.name,
                    clean_name(names.master),
                    chan.stores.slave.name,
                    clean_name(names.slave)
                ),
            };
            let state = PathBuf::from(name);
            let dir = state
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| StateError::BadLocation(state.clone()))?;
            fs::create_dir_all(dir)?;
            state
        };

        let suffixed = |suffix: &str| {
            let mut s = state.clone().into_os_string();
            s.push(suffix);
            PathBuf::from(s)
        };
        Ok(StatePaths {
            new: suffixed(".new"),
            journal: suffixed(".journal"),
            lock: suffixed(".lock"),
            state,
        })
    }

    /// Create (truncate) the new-state file. Its presence marks the journal
    /// as live: recovery only replays the journal when this file exists.
    pub fn create_new_marker(&self) -> io::Result<()> {
        File::create(&self.new).map(drop)
    }
}

/// In-memory image of the persisted state after loading (and, if applicable,
/// journal replay).
#[derive(Debug, Default)]
pub struct LoadedState {
    pub recs: Vec<SyncRec>,
    pub uidval: Pair<Option<u32>>,
    pub maxuid: Pair<u32>,
    /// Highest slave UID ever expired.
    pub smaxxuid: u32,
    /// UIDs at or above this may need TUID lookup.
    pub newuid: Pair<u32>,
    /// A journal was replayed; the run is a recovery.
    pub replayed: bool,
}

fn read_lines(path: &Path, what: &'static str) -> Result<Option<Vec<String>>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !content.is_empty() && !content.ends_with('\n') {
        return Err(StateError::Incomplete {
            what,
            path: path.to_path_buf(),
            line: content.lines().count(),
        });
    }
    Ok(Some(content.lines().map(str::to_owned).collect()))
}

/// Load the committed state, then replay the journal on top of it if the
/// previous run died mid-commit.
pub fn load_state(paths: &StatePaths) -> Result<LoadedState, StateError> {
    let mut st = LoadedState::default();

    if let Some(lines) = read_lines(&paths.state, "sync state entry")? {
        debug!(path = %paths.state.display(), "reading sync state");
        let mut lines = lines.into_iter().enumerate();
        let (_, header) = lines.next().ok_or(StateError::Incomplete {
            what: "sync state header",
            path: paths.state.clone(),
            line: 1,
        })?;
        parse_state_header(&header, paths, &mut st)?;
        for (idx, line) in lines {
            st.recs
                .push(parse_state_entry(&line, paths, idx + 1)?);
        }
    }

    // Only replay when the new-state marker exists; otherwise any leftover
    // journal is stale and the committed state is authoritative.
    if paths.journal.exists() && paths.new.exists() {
        if let Some(lines) = read_lines(&paths.journal, "journal entry")? {
            debug!(path = %paths.journal.display(), "recovering journal");
            replay_journal(&lines, paths, &mut st)?;
            st.replayed = true;
        }
    }

    Ok(st)
}

fn parse_state_header(
    header: &str,
    paths: &StatePaths,
    st: &mut LoadedState,
) -> Result<(), StateError> {
    let invalid = || StateError::Invalid {
        what: "sync state header",
        path: paths.state.clone(),
        line: 1,
    };
    let mut tokens = header.split_whitespace();
    let (mtok, stok) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(m), Some(s), None) => (m, s),
        _ => return Err(invalid()),
    };
    let mut mparts = mtok.split(':');
    let mut sparts = stok.split(':');
    let mut int = |p: &mut std::str::Split<'_, char>| -> Result<u32, StateError> {
        p.next()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(invalid)
    };
    st.uidval.master = Some(int(&mut mparts)?);
    st.maxuid.master = int(&mut mparts)?;
    st.uidval.slave = Some(int(&mut sparts)?);
    st.smaxxuid = int(&mut sparts)?;
    st.maxuid.slave = int(&mut sparts)?;
    if mparts.next().is_some() || sparts.next().is_some() {
        return Err(invalid());
    }
    Ok(())
}

fn parse_state_entry(
    line: &str,
    paths: &StatePaths,
    lineno: usize,
) -> Result<SyncRec, StateError> {
    let invalid = || StateError::Invalid {
        what: "sync state entry",
        path: paths.state.clone(),
        line: lineno,
    };
    let mut tokens = line.split_whitespace();
    let uid_m = tokens
        .next()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(UidSlot::from_disk)
        .ok_or_else(invalid)?;
    let uid_s = tokens
        .next()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(UidSlot::from_disk)
        .ok_or_else(invalid)?;
    let mut rec = SyncRec::new(Pair::new(uid_m, uid_s));
    let mut ftok = tokens.next().unwrap_or("");
    if tokens.next().is_some() {
        return Err(invalid());
    }
    if let Some(rest) = ftok.strip_prefix('X') {
        rec.expire = true;
        rec.expired = true;
        ftok = rest;
    }
    rec.flags = Flags::parse(ftok).ok_or_else(invalid)?;
    debug!(
        uid_m = rec.uid.master.disk(),
        uid_s = rec.uid.slave.disk(),
        flags = %rec.flags,
        expired = rec.expired,
        "state entry"
    );
    Ok(rec)
}

fn replay_journal(
    lines: &[String],
    paths: &StatePaths,
    st: &mut LoadedState,
) -> Result<(), StateError> {
    let mut lines = lines.iter().enumerate();
    let (_, version) = lines.next().ok_or(StateError::Incomplete {
        what: "journal header",
        path: paths.journal.clone(),
        line: 1,
    })?;
    if version != JOURNAL_VERSION {
        return Err(StateError::JournalVersion {
            got: version.clone(),
            path: paths.journal.clone(),
            expected: JOURNAL_VERSION,
        });
    }

    let mut last = 0usize;
    for (idx, line) in lines {
        let lineno = idx + 1;
        let invalid = || StateError::Invalid {
            what: "journal entry",
            path: paths.journal.clone(),
            line: lineno,
        };
        let (op, rest) = line.split_at(line.len().min(1));
        let op = op.bytes().next().ok_or_else(invalid)?;
        let mut tokens = rest.split_whitespace();
        let mut int = |tokens: &mut std::str::SplitWhitespace<'_>| {
            tokens
                .next()
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(invalid)
        };

        match op {
            b'(' | b')' | b'{' | b'}' => {
                let v = int(&mut tokens)?;
                if v < 0 || tokens.next().is_some() {
                    return Err(invalid());
                }
                let v = v as u32;
                match op {
                    b'(' => st.maxuid.master = v,
                    b')' => st.maxuid.slave = v,
                    b'{' => st.newuid.master = v,
                    _ => st.newuid.slave = v,
                }
            }
            b'|' => {
                let m = int(&mut tokens)?;
                let s = int(&mut tokens)?;
                if m < 0 || s < 0 || tokens.next().is_some() {
                    return Err(invalid());
                }
                st.uidval = Pair::new(Some(m as u32), Some(s as u32));
            }
            b'+' => {
                let m = int(&mut tokens)?;
                let s = int(&mut tokens)?;
                if tokens.next().is_some() {
                    return Err(invalid());
                }
                let uid_m = UidSlot::from_disk(m).ok_or_else(invalid)?;
                let uid_s = UidSlot::from_disk(s).ok_or_else(invalid)?;
                debug!(uid_m = m, uid_s = s, "journal: new entry");
                st.recs.push(SyncRec::new(Pair::new(uid_m, uid_s)));
                last = st.recs.len() - 1;
            }
            _ => {
                let m = int(&mut tokens)?;
                let s = int(&mut tokens)?;
                let ri = find_rec(&st.recs, last, m, s).ok_or(StateError::UnknownRecord {
                    path: paths.journal.clone(),
                    line: lineno,
                })?;
                last = ri;
                apply_journal_op(st, ri, op, &mut tokens, invalid)?;
                if tokens.next().is_some() {
                    return Err(invalid());
                }
            }
        }
    }
    Ok(())
}

fn find_rec(recs: &[SyncRec], last: usize, m: i64, s: i64) -> Option<usize> {
    let n = recs.len();
    (last..n)
        .chain(0..last)
        .find(|&i| recs[i].uid.master.disk() == m && recs[i].uid.slave.disk() == s)
}

fn apply_journal_op(
    st: &mut LoadedState,
    ri: usize,
    op: u8,
    tokens: &mut std::str::SplitWhitespace<'_>,
    invalid: impl Fn() -> StateError,
) -> Result<(), StateError> {
    let rec = &mut st.recs[ri];
    match op {
        b'-' => {
            debug!("journal: entry killed");
            rec.dead = true;
        }
        b'#' => {
            let tuid = tokens
                .next()
                .and_then(|t| Tuid::from_bytes(t.as_bytes()))
                .ok_or_else(invalid)?;
            debug!(tuid = %tuid, "journal: TUID assigned");
            for side in Side::ALL {
                if let UidSlot::Pending(_) = rec.uid[side] {
                    rec.uid[side] = UidSlot::Pending(Some(tuid));
                    break;
                }
            }
        }
        b'&' => {
            debug!("journal: TUID lost");
            rec.flags = Flags::NONE;
            for side in Side::ALL {
                if let UidSlot::Pending(_) = rec.uid[side] {
                    rec.uid[side] = UidSlot::Pending(None);
                    break;
                }
            }
        }
        b'<' | b'>' => {
            let v = tokens.next().and_then(|v| v.parse::<i64>().ok());
            let slot = v.and_then(UidSlot::from_disk).ok_or_else(invalid)?;
            let side = if op == b'<' { Side::Master } else { Side::Slave };
            debug!(side = side.label(), uid = slot.disk(), "journal: UID resolved");
            rec.uid[side] = slot;
        }
        b'*' => {
            let v = tokens
                .next()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v >= 0)
                .ok_or_else(invalid)?;
            rec.flags = Flags::from_bits(v as u8);
            debug!(flags = %rec.flags, "journal: flags updated");
        }
        b'~' => {
            let v = tokens
                .next()
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(invalid)?;
            rec.expire = v != 0;
            debug!(expire = rec.expire, "journal: expire intent");
        }
        b'\\' => {
            rec.expire = rec.expired;
            debug!(expire = rec.expire, "journal: expire reverted");
        }
        b'/' => {
            if rec.expire {
                if let Some(uid) = rec.uid.slave.uid() {
                    if st.smaxxuid < uid {
                        st.smaxxuid = uid;
                    }
                }
                rec.expired = true;
            } else {
                rec.expired = false;
            }
            debug!(expired = rec.expired, "journal: expire committed");
        }
        _ => return Err(invalid()),
    }
    Ok(())
}

fn write_failed(what: &str, err: &io::Error) -> ! {
    // Preserving the committed state matters more than graceful shutdown.
    error!(error = %err, "cannot write {what}; disk full?");
    std::process::exit(1);
}

/// The append-only write-ahead journal. Entries are flushed line by line;
/// TUID assignments are additionally fdatasync'd under thorough fsync so a
/// copy never outruns its journal entry.
pub struct Journal {
    out: LineWriter<File>,
    fsync: FsyncLevel,
}

impl Journal {
    /// Open the journal. A recovery run appends to the replayed journal; a
    /// fresh run truncates any stale one and starts with the version line.
    pub fn open(path: &Path, fsync: FsyncLevel, append: bool) -> io::Result<Journal> {
        let file = if append {
            OpenOptions::new().append(true).create(true).open(path)?
        } else {
            File::create(path)?
        };
        let mut journal = Journal {
            out: LineWriter::new(file),
            fsync,
        };
        if !append {
            journal.write(format_args!("{}", JOURNAL_VERSION));
        }
        Ok(journal)
    }

    fn write(&mut self, line: fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{}", line) {
            write_failed("journal", &e);
        }
    }

    pub fn new_rec(&mut self, uid: Pair<UidSlot>) {
        self.write(format_args!("+ {} {}", uid.master.disk(), uid.slave.disk()));
    }

    pub fn kill(&mut self, uid: Pair<UidSlot>) {
        self.write(format_args!("- {} {}", uid.master.disk(), uid.slave.disk()));
    }

    pub fn resolve(&mut self, side: Side, uid: Pair<UidSlot>, to: UidSlot) {
        let op = match side {
            Side::Master => '<',
            Side::Slave => '>',
        };
        self.write(format_args!(
            "{} {} {} {}",
            op,
            uid.master.disk(),
            uid.slave.disk(),
            to.disk()
        ));
    }

    pub fn flags(&mut self, uid: Pair<UidSlot>, flags: Flags) {
        self.write(format_args!(
            "* {} {} {}",
            uid.master.disk(),
            uid.slave.disk(),
            flags.bits()
        ));
    }

    pub fn tuid(&mut self, uid: Pair<UidSlot>, tuid: &Tuid) {
        self.write(format_args!(
            "# {} {} {}",
            uid.master.disk(),
            uid.slave.disk(),
            tuid
        ));
        if self.fsync >= FsyncLevel::Thorough {
            if let Err(e) = self.out.get_ref().sync_data() {
                write_failed("journal", &e);
            }
        }
    }

    pub fn tuid_lost(&mut self, uid: Pair<UidSlot>) {
        self.write(format_args!("& {} {}", uid.master.disk(), uid.slave.disk()));
    }

    pub fn expire_intent(&mut self, uid: Pair<UidSlot>, on: bool) {
        self.write(format_args!(
            "~ {} {} {}",
            uid.master.disk(),
            uid.slave.disk(),
            on as u8
        ));
    }

    pub fn expire_revert(&mut self, uid: Pair<UidSlot>) {
        self.write(format_args!(
            "\\ {} {}",
            uid.master.disk(),
            uid.slave.disk()
        ));
    }

    pub fn expire_commit(&mut self, uid: Pair<UidSlot>) {
        self.write(format_args!("/ {} {}", uid.master.disk(), uid.slave.disk()));
    }

    pub fn max_uid(&mut self, side: Side, uid: u32) {
        let op = match side {
            Side::Master => '(',
            Side::Slave => ')',
        };
        self.write(format_args!("{} {}", op, uid));
    }

    pub fn new_uid_floor(&mut self, side: Side, uid: u32) {
        let op = match side {
            Side::Master => '{',
            Side::Slave => '}',
        };
        self.write(format_args!("{} {}", op, uid));
    }

    pub fn uidvalidity(&mut self, uv: Pair<u32>) {
        self.write(format_args!("| {} {}", uv.master, uv.slave));
    }
}

/// Header values of the state file.
#[derive(Debug, Clone, Copy)]
pub struct StateHeader {
    pub uidval: Pair<u32>,
    pub maxuid: Pair<u32>,
    pub smaxxuid: u32,
}

/// Write the complete new state to `state.new`. Exits the process on write
/// failure: the committed state must survive a full disk.
pub fn write_new_state(
    paths: &StatePaths,
    header: &StateHeader,
    recs: &[SyncRec],
    fsync: FsyncLevel,
) {
    let write = || -> io::Result<()> {
        let mut out = BufWriter::new(File::create(&paths.new)?);
        writeln!(
            out,
            "{}:{} {}:{}:{}",
            header.uidval.master,
            header.maxuid.master,
            header.uidval.slave,
            header.smaxxuid,
            header.maxuid.slave
        )?;
        for rec in recs.iter().filter(|r| r.live()) {
            writeln!(
                out,
                "{} {} {}{}",
                rec.uid.master.disk(),
                rec.uid.slave.disk(),
                if rec.expired { "X" } else { "" },
                rec.flags
            )?;
        }
        out.flush()?;
        if fsync >= FsyncLevel::Normal {
            out.get_ref().sync_data()?;
        }
        Ok(())
    };
    if let Err(e) = write() {
        write_failed("new sync state", &e);
    }
}

/// Atomically promote `state.new` to `state` and drop the journal. The
/// rename is the linearization point of the whole run.
pub fn commit_state(paths: &StatePaths) {
    if let Err(e) = fs::rename(&paths.new, &paths.state) {
        write_failed("sync state", &e);
    }
    let _ = fs::remove_file(&paths.journal);
}

/// Advisory write lock on `{state}.lock`, held for the lifetime of the
/// channel run.
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(path: &Path) -> Result<StateLock, LockError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let mut lck: libc::flock = unsafe { std::mem::zeroed() };
            lck.l_type = libc::F_WRLCK as libc::c_short;
            lck.l_whence = libc::SEEK_SET as libc::c_short;
            if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lck) } < 0 {
                let err = io::Error::last_os_error();
                return Err(
                    if matches!(err.raw_os_error(), Some(libc::EACCES) | Some(libc::EAGAIN)) {
                        LockError::Contended
                    } else {
                        LockError::Io(err)
                    },
                );
            }
        }
        Ok(StateLock {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn release(self) {
        let _ = fs::remove_file(&self.path);
    }
}
