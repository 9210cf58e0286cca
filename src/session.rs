//! The read/digest substitution state machine.
//!
//! codesign walks its output file with `read(fd, buf, 4096)`, feeds each page
//! to `CCDigestUpdate` and collects it with `CCDigestFinal`. While that exact
//! cadence holds we answer reads without touching the file and hand out
//! precomputed page digests. The first call that does not fit tears the
//! session down and everything goes back to real I/O.
//!
//! Nothing in here performs I/O. Transitions return what the caller has to do.

use log::debug;
use std::mem;
use std::os::unix::io::RawFd;

use crate::digest::{BlockDigest, DigestSequence, BLOCK_SIZE};
use crate::result::Fatal;

/// Substitution state for one target file.
#[derive(Debug)]
pub struct Session {
    fd: RawFd,
    digests: DigestSequence,
    cursor: usize,
    position: u64,
}

impl Session {
    pub fn new(fd: RawFd, digests: DigestSequence) -> Session {
        Session {
            fd,
            digests,
            cursor: 0,
            position: 0,
        }
    }

    /// Descriptor whose reads started this session.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bytes of simulated reading so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Index of the next digest to hand out.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn digests(&self) -> &DigestSequence {
        &self.digests
    }

    fn drained(&self) -> bool {
        self.position >= self.digests.file_size()
    }

    fn fake_read(&mut self, len: usize) -> usize {
        let remaining = self.digests.file_size() - self.position;
        let n = (len as u64).min(remaining);
        self.position += n;
        n as usize
    }

    fn exhausted(&self) -> bool {
        self.cursor >= self.digests.len()
    }

    /// Length of the page at the cursor. Past the end only whole pages fit.
    fn expected_update_len(&self) -> usize {
        self.digests.block_len(self.cursor).unwrap_or(BLOCK_SIZE)
    }

    fn next_digest(&mut self) -> Result<BlockDigest, Fatal> {
        let digest = *self.digests.get(self.cursor).ok_or(Fatal::CursorOverrun {
            count: self.digests.len(),
        })?;
        self.cursor += 1;
        Ok(digest)
    }
}

/// What the interposed `read` has to do after the state machine saw the call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Return this many bytes without reading anything.
    Synthetic(usize),
    /// Forward to the real `read`.
    Real,
    /// The session ended: seek `fd` to `position` so the real file offset
    /// matches what the host believes it read, then forward to the real `read`.
    RestoreAndReal { fd: RawFd, position: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing to hash, the digest is already known.
    Skipped,
    Real,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FinalOutcome {
    Substituted(BlockDigest),
    Real,
}

#[derive(Debug, Default)]
pub enum Phase {
    /// No session, every call is forwarded.
    #[default]
    Idle,
    /// Reads on the session descriptor are simulated.
    Active(Session),
    /// The whole file has been "read". Digests may still be collected, the
    /// next read ends the session.
    Draining(Session),
    /// Every digest was handed out after the whole file was "read". Digest
    /// and stat calls are real again, but `fd` still sits at offset 0 until
    /// the next read restores it to `position`.
    Exhausted { fd: RawFd, position: u64 },
}

impl Phase {
    pub fn is_live(&self) -> bool {
        self.session().is_some()
    }

    /// No session and no offset left to restore.
    pub fn is_idle(&self) -> bool {
        matches!(self, Phase::Idle)
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Phase::Idle | Phase::Exhausted { .. } => None,
            Phase::Active(s) | Phase::Draining(s) => Some(s),
        }
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            Phase::Idle | Phase::Exhausted { .. } => None,
            Phase::Active(s) | Phase::Draining(s) => Some(s),
        }
    }

    /// Descriptor whose offset we are still responsible for.
    fn owner(&self) -> Option<RawFd> {
        match self {
            Phase::Idle => None,
            Phase::Exhausted { fd, .. } => Some(*fd),
            Phase::Active(s) | Phase::Draining(s) => Some(s.fd),
        }
    }

    fn settle(session: Session) -> Phase {
        if !session.drained() {
            Phase::Active(session)
        } else if session.exhausted() {
            debug!(
                "session on fd {} exhausted after {} digests",
                session.fd, session.cursor
            );
            Phase::Exhausted {
                fd: session.fd,
                position: session.position,
            }
        } else {
            Phase::Draining(session)
        }
    }

    pub fn start(&mut self, session: Session) -> Result<(), Fatal> {
        if let Some(fd) = self.owner() {
            return Err(Fatal::SessionAlreadyActive { fd });
        }
        debug!(
            "start session on fd {}: {} pages, {} bytes",
            session.fd,
            session.digests.len(),
            session.digests.file_size()
        );
        *self = Phase::settle(session);
        Ok(())
    }

    pub fn on_read(&mut self, fd: RawFd, len: usize) -> ReadOutcome {
        match mem::take(self) {
            Phase::Idle => ReadOutcome::Real,
            Phase::Exhausted { fd: ended, position } => ReadOutcome::RestoreAndReal {
                fd: ended,
                position,
            },
            Phase::Active(mut session) if session.fd == fd && len == BLOCK_SIZE => {
                let n = session.fake_read(len);
                *self = Phase::settle(session);
                ReadOutcome::Synthetic(n)
            }
            Phase::Active(session) => {
                debug!(
                    "read of {} bytes on fd {} diverges from session on fd {} at {}",
                    len, fd, session.fd, session.position
                );
                ReadOutcome::RestoreAndReal {
                    fd: session.fd,
                    position: session.position,
                }
            }
            Phase::Draining(session) => {
                debug!(
                    "session on fd {} drained after {} digests",
                    session.fd, session.cursor
                );
                ReadOutcome::RestoreAndReal {
                    fd: session.fd,
                    position: session.position,
                }
            }
        }
    }

    pub fn on_update(&mut self, len: usize) -> Result<UpdateOutcome, Fatal> {
        let session = match self.session_mut() {
            Some(s) => s,
            None => return Ok(UpdateOutcome::Real),
        };
        let expected = session.expected_update_len();
        if len != expected {
            return Err(Fatal::UnexpectedUpdateLength { expected, got: len });
        }
        Ok(UpdateOutcome::Skipped)
    }

    pub fn on_final(&mut self) -> Result<FinalOutcome, Fatal> {
        let digest = match self.session_mut() {
            Some(s) => s.next_digest()?,
            None => return Ok(FinalOutcome::Real),
        };
        if matches!(self, Phase::Draining(_)) {
            if let Phase::Draining(session) = mem::take(self) {
                *self = Phase::settle(session);
            }
        }
        Ok(FinalOutcome::Substituted(digest))
    }

    /// Drops the session if `fd` is its descriptor. Returns whether it did.
    pub fn on_close(&mut self, fd: RawFd) -> bool {
        if self.owner() != Some(fd) {
            return false;
        }
        debug!("session fd {} closed", fd);
        *self = Phase::Idle;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FD: RawFd = 7;

    fn sequence(len: usize) -> DigestSequence {
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        DigestSequence::from_bytes(&data, 3).expect("hashing failed")
    }

    fn started(len: usize) -> (Phase, DigestSequence) {
        let digests = sequence(len);
        let mut phase = Phase::Idle;
        phase
            .start(Session::new(FD, digests.clone()))
            .expect("cannot start");
        (phase, digests)
    }

    #[test]
    fn idle_forwards_everything() {
        let mut phase = Phase::Idle;
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Real);
        assert_eq!(phase.on_update(123), Ok(UpdateOutcome::Real));
        assert_eq!(phase.on_final(), Ok(FinalOutcome::Real));
        assert!(!phase.on_close(FD));
    }

    #[test]
    fn cadence_over_4097_bytes() {
        let (mut phase, digests) = started(4097);

        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(4096));
        assert_eq!(phase.on_update(4096), Ok(UpdateOutcome::Skipped));
        assert_eq!(
            phase.on_final(),
            Ok(FinalOutcome::Substituted(*digests.get(0).expect("page 0")))
        );

        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(1));
        assert!(matches!(phase, Phase::Draining(_)));
        assert_eq!(phase.on_update(1), Ok(UpdateOutcome::Skipped));
        assert_eq!(
            phase.on_final(),
            Ok(FinalOutcome::Substituted(*digests.get(1).expect("page 1")))
        );

        assert_eq!(
            phase.on_read(FD, BLOCK_SIZE),
            ReadOutcome::RestoreAndReal {
                fd: FD,
                position: 4097
            }
        );
        assert!(!phase.is_live());
    }

    #[test]
    fn exact_multiple_drains_on_last_full_read() {
        let (mut phase, digests) = started(2 * BLOCK_SIZE);
        for i in 0..2 {
            assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(BLOCK_SIZE));
            assert_eq!(phase.on_update(BLOCK_SIZE), Ok(UpdateOutcome::Skipped));
            assert_eq!(
                phase.on_final(),
                Ok(FinalOutcome::Substituted(*digests.get(i).expect("page")))
            );
        }
        assert!(matches!(
            phase,
            Phase::Exhausted {
                fd: FD,
                position: 8192
            }
        ));
        assert!(!phase.is_live());
    }

    #[test]
    fn exhausted_session_forwards_digests_until_next_read() {
        let (mut phase, _) = started(2 * BLOCK_SIZE);
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(BLOCK_SIZE));
        assert!(matches!(phase.on_final(), Ok(FinalOutcome::Substituted(_))));
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(BLOCK_SIZE));
        assert!(matches!(phase, Phase::Draining(_)));
        assert!(matches!(phase.on_final(), Ok(FinalOutcome::Substituted(_))));

        // codesign goes on hashing its own structures
        assert_eq!(phase.on_update(32), Ok(UpdateOutcome::Real));
        assert_eq!(phase.on_final(), Ok(FinalOutcome::Real));
        assert!(!phase.is_idle());
        assert_eq!(
            phase.on_read(FD, BLOCK_SIZE),
            ReadOutcome::RestoreAndReal {
                fd: FD,
                position: 2 * BLOCK_SIZE as u64
            }
        );
        assert!(phase.is_idle());
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Real);
    }

    #[test]
    fn closing_exhausted_descriptor_forgets_restore() {
        let (mut phase, _) = started(BLOCK_SIZE);
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(BLOCK_SIZE));
        assert!(matches!(phase.on_final(), Ok(FinalOutcome::Substituted(_))));
        assert!(phase.on_close(FD));
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Real);
    }

    #[test]
    fn tail_read_of_other_size_diverges() {
        let (mut phase, _) = started(BLOCK_SIZE + 176);
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(BLOCK_SIZE));
        assert_eq!(
            phase.on_read(FD, 176),
            ReadOutcome::RestoreAndReal {
                fd: FD,
                position: BLOCK_SIZE as u64
            }
        );
        assert!(!phase.is_live());
        // digests are real again
        assert_eq!(phase.on_update(176), Ok(UpdateOutcome::Real));
    }

    #[test]
    fn read_on_other_fd_diverges() {
        let (mut phase, _) = started(4 * BLOCK_SIZE);
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(BLOCK_SIZE));
        assert_eq!(
            phase.on_read(FD + 1, BLOCK_SIZE),
            ReadOutcome::RestoreAndReal {
                fd: FD,
                position: BLOCK_SIZE as u64
            }
        );
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Real);
    }

    #[test]
    fn wrong_update_length_is_fatal() {
        let (mut phase, _) = started(3 * BLOCK_SIZE);
        assert_eq!(phase.on_read(FD, BLOCK_SIZE), ReadOutcome::Synthetic(BLOCK_SIZE));
        assert_eq!(
            phase.on_update(100),
            Err(Fatal::UnexpectedUpdateLength {
                expected: BLOCK_SIZE,
                got: 100
            })
        );
    }

    #[test]
    fn finalizing_past_the_end_is_fatal() {
        let (mut phase, _) = started(10);
        assert!(matches!(phase.on_final(), Ok(FinalOutcome::Substituted(_))));
        assert_eq!(phase.on_final(), Err(Fatal::CursorOverrun { count: 1 }));
    }

    #[test]
    fn update_past_the_end_only_checks_length() {
        let (mut phase, _) = started(10);
        assert!(matches!(phase.on_final(), Ok(FinalOutcome::Substituted(_))));
        assert_eq!(phase.on_update(BLOCK_SIZE), Ok(UpdateOutcome::Skipped));
        assert_eq!(
            phase.on_update(10),
            Err(Fatal::UnexpectedUpdateLength {
                expected: BLOCK_SIZE,
                got: 10
            })
        );
    }

    #[test]
    fn second_session_is_fatal() {
        let (mut phase, digests) = started(BLOCK_SIZE);
        assert_eq!(
            phase.start(Session::new(FD + 1, digests)),
            Err(Fatal::SessionAlreadyActive { fd: FD })
        );
    }

    #[test]
    fn empty_file_starts_exhausted() {
        let (mut phase, _) = started(0);
        assert!(matches!(phase, Phase::Exhausted { fd: FD, position: 0 }));
        assert!(!phase.is_live());
        assert_eq!(phase.on_update(BLOCK_SIZE), Ok(UpdateOutcome::Real));
        assert_eq!(
            phase.on_read(FD, BLOCK_SIZE),
            ReadOutcome::RestoreAndReal { fd: FD, position: 0 }
        );
    }

    #[test]
    fn close_drops_only_own_session() {
        let (mut phase, _) = started(BLOCK_SIZE);
        assert!(!phase.on_close(FD + 1));
        assert!(phase.is_live());
        assert!(phase.on_close(FD));
        assert!(!phase.is_live());
    }
}
