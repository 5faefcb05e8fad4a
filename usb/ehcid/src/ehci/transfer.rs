use log::trace;
use smallvec::SmallVec;
use std::result;

use super::pool::Id;
use super::qtd::{page_pointers, Pid, Qtd, QtdWords, LINK_TERMINATE, QTD_MAX_TRANSFER};
use super::{HostState, MAX_TRANSFERS};
use crate::driver_interface::{
    Direction, DmaBuf, Error, PipeId, PipeType, Rejected, Resource, Result, Setup,
};
use crate::usb::ReqDirection;

pub type TransferId = Id<Transfer>;

/// The part of a transfer a qTD carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Setup,
    Data,
    Status,
    /// A bulk or interrupt transfer.
    Normal,
}

/// One qTD plus the bookkeeping software needs to retire it. A submission is a chain of these;
/// only the last element of a chain carries the pipe, the buffer and the requested length.
#[repr(C)]
pub struct Transfer {
    pub(crate) qtd: Qtd,
    /// SETUP packet storage, pointed at by the qTD of a setup stage.
    pub(crate) setup: [u8; 8],
    pub(crate) stage: Stage,
    pub(crate) chain_next: Option<TransferId>,
    pub(crate) next_followup: Option<TransferId>,
    pub(crate) prev_followup: Option<TransferId>,
    pub(crate) pipe: Option<PipeId>,
    pub(crate) buf: Option<DmaBuf>,
    pub(crate) length: u32,
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            qtd: Qtd::default(),
            setup: [0; 8],
            stage: Stage::Normal,
            chain_next: None,
            next_followup: None,
            prev_followup: None,
            pipe: None,
            buf: None,
            length: 0,
        }
    }
}

impl Transfer {
    pub(crate) fn setup_phys(&self) -> u32 {
        self.setup.as_ptr() as usize as u32
    }
}

/// Chains handed to the controller and not yet retired, oldest first.
#[derive(Clone, Copy, Debug, Default)]
pub struct FollowupList {
    pub(crate) head: Option<TransferId>,
    pub(crate) tail: Option<TransferId>,
}

struct Element {
    words: QtdWords,
    stage: Stage,
}

impl Element {
    fn new(words: QtdWords, stage: Stage) -> Self {
        Self { words, stage }
    }
}

/// Splits `len` bytes at `addr` into qTD sized pieces. A zero-length transfer still takes one.
fn pieces(addr: u32, len: usize) -> impl Iterator<Item = (u32, u32)> {
    let count = len.div_ceil(QTD_MAX_TRANSFER).max(1);
    (0..count).map(move |i| {
        let offset = i * QTD_MAX_TRANSFER;
        let size = (len - offset).min(QTD_MAX_TRANSFER);
        (addr.wrapping_add(offset as u32), size as u32)
    })
}

impl HostState {
    fn qtd_phys(&self, id: TransferId) -> u32 {
        self.transfers
            .get(id)
            .map_or(LINK_TERMINATE, |transfer| transfer.qtd.phys())
    }

    /// The elements of the chain starting at `head`, in order.
    pub(crate) fn chain(&self, head: TransferId) -> SmallVec<[TransferId; 8]> {
        let mut chain = SmallVec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.transfers.get(id).and_then(|transfer| transfer.chain_next);
        }
        chain
    }

    /// The pipe a chain was queued on, recorded on its last element.
    pub(crate) fn chain_pipe(&self, head: TransferId) -> Option<PipeId> {
        let last = *self.chain(head).last()?;
        self.transfers.get(last)?.pipe
    }

    pub(crate) fn free_chain(&mut self, head: TransferId) -> Result<()> {
        for id in self.chain(head) {
            self.transfers.free(id)?;
        }
        Ok(())
    }

    pub(crate) fn followup_push(&mut self, head: TransferId) {
        let tail = self.followup.tail;
        if let Some(transfer) = self.transfers.get_mut(head) {
            transfer.prev_followup = tail;
            transfer.next_followup = None;
        }
        match tail.and_then(|tail| self.transfers.get_mut(tail)) {
            Some(tail) => tail.next_followup = Some(head),
            None => self.followup.head = Some(head),
        }
        self.followup.tail = Some(head);
    }

    pub(crate) fn followup_remove(&mut self, head: TransferId) {
        let (prev, next) = match self.transfers.get_mut(head) {
            Some(transfer) => (
                transfer.prev_followup.take(),
                transfer.next_followup.take(),
            ),
            None => return,
        };
        match prev.and_then(|prev| self.transfers.get_mut(prev)) {
            Some(prev) => prev.next_followup = next,
            None => self.followup.head = next,
        }
        match next.and_then(|next| self.transfers.get_mut(next)) {
            Some(next) => next.prev_followup = prev,
            None => self.followup.tail = prev,
        }
    }

    /// Chain heads on the followup list, oldest first.
    pub(crate) fn followups(&self) -> SmallVec<[TransferId; 16]> {
        let mut heads = SmallVec::new();
        let mut cursor = self.followup.head;
        while let Some(id) = cursor {
            heads.push(id);
            cursor = self.transfers.get(id).and_then(|transfer| transfer.next_followup);
        }
        heads
    }

    /// Queues a bulk or interrupt transfer moving the whole of `buf`.
    pub(crate) fn queue_normal(&mut self, pipe_id: PipeId, buf: DmaBuf) -> result::Result<(), Rejected> {
        let (ty, direction) = match self.pipe(pipe_id) {
            Ok(pipe) => (pipe.ty, pipe.direction),
            Err(error) => return Err(Rejected { error, buf }),
        };
        if ty == PipeType::Control {
            return Err(Rejected {
                error: Error::Unsupported("bulk or interrupt transfer on a control pipe"),
                buf,
            });
        }
        if buf.len() > MAX_TRANSFERS * QTD_MAX_TRANSFER {
            return Err(Rejected {
                error: Error::TransferTooLarge(buf.len() as u32),
                buf,
            });
        }

        let pid = match direction {
            Direction::In => Pid::In,
            Direction::Out => Pid::Out,
        };
        let count = buf.len().div_ceil(QTD_MAX_TRANSFER).max(1);
        let mut elements: SmallVec<[Element; 4]> = SmallVec::new();
        for (i, (addr, len)) in pieces(buf.phys(), buf.len()).enumerate() {
            let words = QtdWords::data(addr, len, pid, false, i + 1 == count);
            elements.push(Element::new(words, Stage::Normal));
        }
        let length = buf.len() as u32;
        self.append(pipe_id, &mut elements, None, buf, length)
    }

    /// Queues a control transfer: SETUP, an optional data stage of `setup.length` bytes of
    /// `buf`, and the status handshake.
    pub(crate) fn queue_control(
        &mut self,
        pipe_id: PipeId,
        setup: &Setup,
        buf: DmaBuf,
    ) -> result::Result<(), Rejected> {
        let (ty, max_packet) = match self.pipe(pipe_id) {
            Ok(pipe) => (pipe.ty, pipe.qh.max_packet()),
            Err(error) => return Err(Rejected { error, buf }),
        };
        if ty != PipeType::Control {
            return Err(Rejected {
                error: Error::Unsupported("control transfer on a non-control pipe"),
                buf,
            });
        }
        let length = usize::from(setup.length);
        if length > buf.len() {
            return Err(Rejected {
                error: Error::TransferTooLarge(length as u32),
                buf,
            });
        }

        let data_in = setup.direction() == ReqDirection::DeviceToHost;
        let (data_pid, status_pid) = if data_in {
            (Pid::In, Pid::Out)
        } else {
            (Pid::Out, Pid::In)
        };
        let max_packet = usize::from(max_packet.max(1));

        let mut elements: SmallVec<[Element; 4]> = SmallVec::new();
        // The buffer pointer is filled in once the storage the setup stage lands in is known.
        elements.push(Element::new(QtdWords::setup(0), Stage::Setup));
        if length > 0 {
            for (addr, len) in pieces(buf.phys(), length) {
                // The data stage starts with DATA1 and toggles every packet.
                let packets = (addr.wrapping_sub(buf.phys()) as usize).div_ceil(max_packet);
                let toggle = packets % 2 == 0;
                let words = QtdWords::data(addr, len, data_pid, toggle, false);
                elements.push(Element::new(words, Stage::Data));
            }
        }
        let status_pid = if length == 0 { Pid::In } else { status_pid };
        elements.push(Element::new(QtdWords::status(status_pid), Stage::Status));

        if let Ok(pipe) = self.pipe_mut(pipe_id) {
            pipe.direction = if data_in { Direction::In } else { Direction::Out };
        }
        self.append(pipe_id, &mut elements, Some(setup.to_bytes()), buf, length as u32)
    }

    /// Appends a chain behind everything queued on the pipe.
    ///
    /// Fresh records are taken for all but the first element, plus one to become the pipe's new
    /// halt. The first element is written into the current halt, token last, so the controller
    /// either still sees an inactive queue end or the complete chain.
    fn append(
        &mut self,
        pipe_id: PipeId,
        elements: &mut [Element],
        setup: Option<[u8; 8]>,
        buf: DmaBuf,
        length: u32,
    ) -> result::Result<(), Rejected> {
        let old_halt = match self.pipe(pipe_id).map(|pipe| pipe.halt) {
            Ok(Some(halt)) => halt,
            Ok(None) | Err(_) => {
                return Err(Rejected {
                    error: Error::NoSuchPipe,
                    buf,
                })
            }
        };
        let count = elements.len();
        if count > MAX_TRANSFERS {
            return Err(Rejected {
                error: Error::TransferTooLarge(length),
                buf,
            });
        }

        let mut fresh: SmallVec<[TransferId; 8]> = SmallVec::new();
        for _ in 0..count {
            match self.transfers.alloc(Transfer::default()) {
                Some(id) => fresh.push(id),
                None => {
                    for id in fresh {
                        let _ = self.transfers.free(id);
                    }
                    return Err(Rejected {
                        error: Error::ResourceExhausted(Resource::Transfers),
                        buf,
                    });
                }
            }
        }

        let slots: SmallVec<[TransferId; 8]> = (0..count)
            .map(|i| if i == 0 { old_halt } else { fresh[i] })
            .collect();
        let phys: SmallVec<[u32; 8]> = slots.iter().map(|id| self.qtd_phys(*id)).collect();
        let new_halt = fresh[0];
        let new_halt_phys = self.qtd_phys(new_halt);
        let status = elements.iter().position(|e| e.stage == Stage::Status);

        for (i, element) in elements.iter_mut().enumerate() {
            element.words.next = phys.get(i + 1).copied().unwrap_or(new_halt_phys);
            element.words.alt_next = match element.stage {
                Stage::Normal => new_halt_phys,
                Stage::Data => status.map_or(LINK_TERMINATE, |status| phys[status]),
                Stage::Setup | Stage::Status => LINK_TERMINATE,
            };
        }

        if let Some(halt) = self.transfers.get_mut(new_halt) {
            halt.qtd.halt();
        }

        let mut buf = Some(buf);
        for i in (0..count).rev() {
            let Some(transfer) = self.transfers.get_mut(slots[i]) else {
                continue;
            };
            transfer.stage = elements[i].stage;
            transfer.chain_next = slots.get(i + 1).copied();
            if i + 1 == count {
                transfer.pipe = Some(pipe_id);
                transfer.buf = buf.take();
                transfer.length = length;
            }
            let mut words = elements[i].words;
            if elements[i].stage == Stage::Setup {
                if let Some(setup) = setup {
                    transfer.setup = setup;
                }
                words.buffer = page_pointers(transfer.setup_phys());
            }
            // Element 0 goes into the old halt, which the controller may be looking at: it is
            // written last.
            transfer.qtd.set(&words);
        }

        if let Ok(pipe) = self.pipe_mut(pipe_id) {
            pipe.halt = Some(new_halt);
        }
        self.followup_push(old_halt);
        trace!(
            "pipe {:?}: queued {} bytes in {} qTDs",
            pipe_id,
            length,
            count
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use common::io::Io;

    use super::*;
    use crate::driver_interface::{DeviceId, PipeCallback, Speed};
    use crate::ehci::qtd::{QTD_TOKEN_ACTIVE, QTD_TOKEN_IOC, QTD_TOKEN_TOGGLE};
    use crate::usb::DescriptorKind;

    fn setup_state() -> (Box<HostState>, DeviceId) {
        let mut state = HostState::new_boxed();
        state.async_head.init_reclamation_head();
        let device = state.add_test_device(Speed::High, 1);
        (state, device)
    }

    fn leaked(len: usize) -> DmaBuf {
        DmaBuf::from_static(Box::leak(vec![0u8; len].into_boxed_slice()))
    }

    #[test]
    fn bulk_chain_sizing_and_ioc() {
        let (mut state, device) = setup_state();
        let pipe = state
            .create_pipe(device, PipeType::Bulk, 1, Direction::In, 512, PipeCallback::None)
            .unwrap();
        let old_halt = state.pipes.get(pipe).unwrap().halt.unwrap();
        let available = state.transfers.available();

        let buf = leaked(40_000);
        let base = buf.phys();
        state.queue_normal(pipe, buf).unwrap();

        assert_eq!(state.transfers.available(), available - 3);
        let new_halt = state.pipes.get(pipe).unwrap().halt.unwrap();
        assert_ne!(new_halt, old_halt);
        assert_eq!(state.followups().as_slice(), &[old_halt]);

        let chain = state.chain(old_halt);
        assert_eq!(chain.len(), 3);
        let halt_phys = state.qtd_phys(new_halt);
        let lengths: Vec<u32> = chain
            .iter()
            .map(|id| state.transfers.get(*id).unwrap().qtd.remaining())
            .collect();
        assert_eq!(lengths, vec![16384, 16384, 40_000 - 2 * 16384]);

        for (i, id) in chain.iter().enumerate() {
            let transfer = state.transfers.get(*id).unwrap();
            let words = transfer.qtd.words();
            let last = i + 1 == chain.len();
            assert_eq!(words.token & QTD_TOKEN_IOC != 0, last);
            assert_eq!(words.token & QTD_TOKEN_ACTIVE, QTD_TOKEN_ACTIVE);
            assert_eq!(words.alt_next, halt_phys);
            assert_eq!(words.buffer[0], base.wrapping_add(i as u32 * 16384));
            assert_eq!(transfer.pipe.is_some(), last);
            assert_eq!(transfer.buf.is_some(), last);
        }
        let last = state.transfers.get(chain[2]).unwrap();
        assert_eq!(last.qtd.next.read(), halt_phys);
        assert_eq!(last.length, 40_000);

        let halt = state.transfers.get(new_halt).unwrap();
        assert!(!halt.qtd.is_active());
        assert_eq!(halt.qtd.next.read(), LINK_TERMINATE);
        assert_eq!(state.chain_pipe(old_halt), Some(pipe));
    }

    #[test]
    fn zero_length_takes_one_qtd() {
        let (mut state, device) = setup_state();
        let pipe = state
            .create_pipe(device, PipeType::Bulk, 2, Direction::Out, 512, PipeCallback::None)
            .unwrap();
        let head = state.pipes.get(pipe).unwrap().halt.unwrap();
        state.queue_normal(pipe, DmaBuf::empty()).unwrap();
        let chain = state.chain(head);
        assert_eq!(chain.len(), 1);
        let qtd = &state.transfers.get(chain[0]).unwrap().qtd;
        assert_eq!(qtd.remaining(), 0);
        assert!(qtd.has_ioc());
        assert_eq!(qtd.pid(), Pid::Out as u8);
    }

    #[test]
    fn control_chain_layout() {
        let (mut state, device) = setup_state();
        let pipe = state.device(device).unwrap().control.unwrap();
        let head = state.pipes.get(pipe).unwrap().halt.unwrap();

        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18);
        state.queue_control(pipe, &setup, leaked(64)).unwrap();

        let chain = state.chain(head);
        assert_eq!(chain.len(), 3);
        let stages: Vec<Stage> = chain
            .iter()
            .map(|id| state.transfers.get(*id).unwrap().stage)
            .collect();
        assert_eq!(stages, vec![Stage::Setup, Stage::Data, Stage::Status]);

        let first = state.transfers.get(chain[0]).unwrap();
        assert_eq!(first.setup, setup.to_bytes());
        assert_eq!(first.qtd.buffer[0].read(), first.setup_phys());
        assert_eq!(first.qtd.pid(), Pid::Setup as u8);
        assert!(!first.qtd.has_ioc());

        let data = state.transfers.get(chain[1]).unwrap().qtd.words();
        assert_eq!(data.alt_next, state.qtd_phys(chain[2]));
        assert_eq!(data.token & QTD_TOKEN_TOGGLE, QTD_TOKEN_TOGGLE);
        assert_eq!((data.token >> 8) & 3, Pid::In as u32);
        assert_eq!((data.token >> 16) & 0x7FFF, 18);

        let status = state.transfers.get(chain[2]).unwrap();
        assert!(status.qtd.has_ioc());
        assert_eq!(status.qtd.pid(), Pid::Out as u8);
        assert_eq!(status.length, 18);
        assert_eq!(state.pipes.get(pipe).unwrap().direction, Direction::In);
    }

    #[test]
    fn no_data_control_has_in_status() {
        let (mut state, device) = setup_state();
        let pipe = state.device(device).unwrap().control.unwrap();
        let head = state.pipes.get(pipe).unwrap().halt.unwrap();
        state
            .queue_control(pipe, &Setup::set_address(3), DmaBuf::empty())
            .unwrap();
        let chain = state.chain(head);
        assert_eq!(chain.len(), 2);
        let status = &state.transfers.get(chain[1]).unwrap().qtd;
        assert_eq!(status.pid(), Pid::In as u8);
    }

    #[test]
    fn exhaustion_changes_nothing() {
        let (mut state, device) = setup_state();
        let pipe = state
            .create_pipe(device, PipeType::Bulk, 1, Direction::In, 512, PipeCallback::None)
            .unwrap();
        let mut hogs = Vec::new();
        while state.transfers.available() > 2 {
            hogs.push(state.transfers.alloc(Transfer::default()).unwrap());
        }
        let halt = state.pipes.get(pipe).unwrap().halt;

        let rejected = state.queue_normal(pipe, leaked(3 * 16384)).unwrap_err();
        assert!(matches!(
            rejected.error,
            Error::ResourceExhausted(Resource::Transfers)
        ));
        assert_eq!(rejected.buf.len(), 3 * 16384);
        assert_eq!(state.transfers.available(), 2);
        assert_eq!(state.pipes.get(pipe).unwrap().halt, halt);
        assert!(state.followups().is_empty());
        assert!(!state.transfers.get(halt.unwrap()).unwrap().qtd.is_active());

        // Two records are enough for a single qTD transfer.
        state.queue_normal(pipe, leaked(512)).unwrap();
        assert_eq!(state.transfers.available(), 1);
    }

    #[test]
    fn rejects_wrong_pipe_kind_and_oversize() {
        let (mut state, device) = setup_state();
        let control = state.device(device).unwrap().control.unwrap();
        let rejected = state.queue_normal(control, leaked(8)).unwrap_err();
        assert!(matches!(rejected.error, Error::Unsupported(_)));

        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18);
        let rejected = state.queue_control(control, &setup, leaked(8)).unwrap_err();
        assert!(matches!(rejected.error, Error::TransferTooLarge(18)));
    }
}
