use log::{debug, error, trace, warn};

use super::regs::EhciRegs;
use super::transfer::{Stage, TransferId};
use super::{try_lock_driver, HostState, UsbHost};
use crate::driver_interface::{
    Completion, DeviceId, DriverId, PipeCallback, PipeId, Setup, TransferError,
};

/// A chain taken off the followup list, waiting for its callback to run.
pub(crate) struct Retired {
    pub(crate) head: TransferId,
    pub(crate) callback: PipeCallback,
    pub(crate) completion: Completion,
}

/// A completion held back because the driver it goes to was locked when it arrived.
pub(crate) enum Parked {
    /// For the driver that opened the pipe.
    Transfer(DriverId, Completion),
    /// For the drivers bound to the device, offered in bind order.
    Control(Completion),
}

impl Parked {
    pub(crate) fn device(&self) -> DeviceId {
        match self {
            Parked::Transfer(_, completion) | Parked::Control(completion) => completion.device,
        }
    }
}

impl HostState {
    /// Whether the chain is finished, and how. `None` while the controller still owns it.
    fn retirement(&self, head: TransferId) -> Option<Result<(), TransferError>> {
        let chain = self.chain(head);
        for (i, id) in chain.iter().enumerate() {
            let transfer = self.transfers.get(*id)?;
            let qtd = &transfer.qtd;
            if qtd.is_halted() {
                return Some(qtd.status());
            }
            if qtd.is_active() {
                return None;
            }
            if i + 1 == chain.len() {
                return Some(Ok(()));
            }
            // A short packet makes the controller leave through alt_next. For bulk and
            // interrupt chains that skips the rest of the chain; a short data stage skips to
            // the status stage, which decides.
            if qtd.remaining() > 0 {
                match transfer.stage {
                    Stage::Normal => return Some(Ok(())),
                    Stage::Data => return self.status_stage(&chain[i + 1..]),
                    Stage::Setup | Stage::Status => (),
                }
            }
        }
        None
    }

    fn status_stage(&self, rest: &[TransferId]) -> Option<Result<(), TransferError>> {
        let status = rest
            .iter()
            .filter_map(|id| self.transfers.get(*id))
            .find(|transfer| transfer.stage == Stage::Status)?;
        if status.qtd.is_halted() {
            Some(status.qtd.status())
        } else if status.qtd.is_active() {
            None
        } else {
            Some(Ok(()))
        }
    }

    /// Takes the oldest retired chain off the followup list. A chain only retires once every
    /// older chain on its pipe has, so completions on a pipe keep submission order.
    pub(crate) fn take_retired(&mut self) -> Option<Retired> {
        let mut blocked = 0u64;
        for head in self.followups() {
            let Some(pipe_id) = self.chain_pipe(head) else {
                continue;
            };
            let bit = 1u64 << pipe_id.index();
            if blocked & bit != 0 {
                continue;
            }
            match self.retirement(head) {
                Some(status) => return self.retire(head, pipe_id, status),
                None => blocked |= bit,
            }
        }
        None
    }

    fn retire(
        &mut self,
        head: TransferId,
        pipe_id: PipeId,
        status: Result<(), TransferError>,
    ) -> Option<Retired> {
        let (device, callback) = match self.pipes.get(pipe_id) {
            Some(pipe) => (pipe.device?, pipe.callback),
            None => {
                error!("chain {:?} outlived its pipe {:?}", head, pipe_id);
                return None;
            }
        };
        self.followup_remove(head);

        let chain = self.chain(head);
        let mut missing = 0;
        let mut setup = None;
        let mut buf = None;
        let mut length = 0;
        for id in chain.iter() {
            let Some(transfer) = self.transfers.get_mut(*id) else {
                continue;
            };
            if transfer.qtd.is_active() {
                transfer.qtd.deactivate();
            }
            match transfer.stage {
                Stage::Setup => setup = Some(Setup::from_bytes(&transfer.setup)),
                Stage::Data | Stage::Normal => missing += transfer.qtd.remaining(),
                Stage::Status => (),
            }
            if transfer.buf.is_some() {
                buf = transfer.buf.take();
                length = transfer.length;
            }
        }

        if let Err(err) = status {
            // The overlay is halted on this chain; resume at whatever is queued behind it.
            let next = self
                .followups()
                .into_iter()
                .find(|next| self.chain_pipe(*next) == Some(pipe_id));
            let halt = self.pipes.get(pipe_id).and_then(|pipe| pipe.halt);
            let resume = next
                .or(halt)
                .and_then(|id| self.transfers.get(id))
                .map(|transfer| transfer.qtd.phys());
            if let (Some(resume), Some(pipe)) = (resume, self.pipes.get_mut(pipe_id)) {
                pipe.qh.restart(resume);
            }
            warn!("pipe {:?}: transfer failed: {}", pipe_id, err);
        }

        let actual = length.saturating_sub(missing);
        trace!(
            "pipe {:?}: retired {} of {} bytes, {:?}",
            pipe_id,
            actual,
            length,
            status
        );
        Some(Retired {
            head,
            callback,
            completion: Completion {
                pipe: pipe_id,
                device,
                buf: buf.unwrap_or_default(),
                length,
                actual,
                status,
                setup,
            },
        })
    }
}

impl<R: EhciRegs> UsbHost<R> {
    /// Delivers every retired chain, one callback per chain, with the lock released around each
    /// callback.
    pub(crate) fn dispatch(&self) {
        loop {
            let retired = self.critical().take_retired();
            let Some(retired) = retired else {
                break;
            };
            let head = retired.head;
            self.deliver(retired.callback, retired.completion);
            if let Err(err) = self.critical().free_chain(head) {
                error!("failed to free chain {:?}: {}", head, err);
            }
        }
    }

    fn deliver(&self, callback: PipeCallback, completion: Completion) {
        match callback {
            PipeCallback::None => trace!("pipe {:?}: no callback", completion.pipe),
            PipeCallback::Enumeration => self.control_complete(completion),
            PipeCallback::Driver(id) => self.hand_over(Parked::Transfer(id, completion)),
        }
    }

    /// Delivers a completion to its driver, or parks it behind the ones already waiting.
    pub(crate) fn hand_over(&self, parked: Parked) {
        let queued = !self.critical().parked.is_empty();
        let parked = if queued {
            Some(parked)
        } else {
            self.try_deliver(parked)
        };
        if let Some(parked) = parked {
            debug!("device {:?}: driver busy, completion parked", parked.device());
            self.critical().parked.push_back(parked);
        }
    }

    /// Hands the completion to its driver unless the driver is locked, in which case it comes
    /// back.
    fn try_deliver(&self, parked: Parked) -> Option<Parked> {
        match parked {
            Parked::Transfer(id, completion) => {
                let Some(driver) = self.critical().drivers.driver(id) else {
                    warn!("completion for unregistered driver {:?}", id);
                    return None;
                };
                let result = match try_lock_driver(&*driver) {
                    Some(mut guard) => {
                        guard.transfer(self, completion);
                        None
                    }
                    None => Some(Parked::Transfer(id, completion)),
                };
                result
            }
            Parked::Control(completion) => self.route_control(completion).err().map(Parked::Control),
        }
    }

    /// Delivers parked completions in order, up to the first whose driver is still locked.
    ///
    /// Runs on every interrupt and when a [super::DriverGuard] drops. Firmware that locks drivers
    /// directly calls it once it lets go.
    pub fn deliver_parked(&self) {
        let _masked = self.mask();
        loop {
            let Some(parked) = self.critical().parked.pop_front() else {
                break;
            };
            if let Some(parked) = self.try_deliver(parked) {
                self.critical().parked.push_front(parked);
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver_interface::{DeviceId, Direction, DmaBuf, PipeType, Speed};
    use crate::ehci::qtd::{QTD_TOKEN_ACTIVE, QTD_TOKEN_BYTES_MASK, QTD_TOKEN_HALTED};
    use crate::usb::DescriptorKind;
    use common::io::Io;

    fn state_with_device() -> (Box<HostState>, DeviceId) {
        let mut state = HostState::new_boxed();
        state.async_head.init_reclamation_head();
        let device = state.add_test_device(Speed::High, 1);
        (state, device)
    }

    fn leaked(len: usize) -> DmaBuf {
        DmaBuf::from_static(Box::leak(vec![0u8; len].into_boxed_slice()))
    }

    /// Finishes every element of a chain the way the controller would, leaving `remaining`
    /// bytes untransferred in the last one.
    fn complete(state: &mut HostState, head: TransferId, remaining: u32) {
        let chain = state.chain(head);
        let last = chain.len() - 1;
        for (i, id) in chain.into_iter().enumerate() {
            let qtd = &mut state.transfers.get_mut(id).unwrap().qtd;
            let left = if i == last { remaining } else { 0 };
            let token = qtd.token.read() & !(QTD_TOKEN_ACTIVE | QTD_TOKEN_BYTES_MASK);
            qtd.token.write(token | (left << 16));
        }
    }

    fn bulk_pipe(state: &mut HostState, device: DeviceId, endpoint: u8) -> PipeId {
        state
            .create_pipe(
                device,
                PipeType::Bulk,
                endpoint,
                Direction::In,
                512,
                PipeCallback::None,
            )
            .unwrap()
    }

    fn queue(state: &mut HostState, pipe: PipeId, len: usize) -> TransferId {
        let head = state.pipes.get(pipe).unwrap().halt.unwrap();
        state.queue_normal(pipe, leaked(len)).unwrap();
        head
    }

    #[test]
    fn nothing_retires_while_active() {
        let (mut state, device) = state_with_device();
        let pipe = bulk_pipe(&mut state, device, 1);
        queue(&mut state, pipe, 64);
        assert!(state.take_retired().is_none());
        assert_eq!(state.followups().len(), 1);
    }

    #[test]
    fn fifo_under_coalescing() {
        let (mut state, device) = state_with_device();
        let pipe = bulk_pipe(&mut state, device, 1);
        let first = queue(&mut state, pipe, 100);
        let second = queue(&mut state, pipe, 200);
        let third = queue(&mut state, pipe, 300);

        // One interrupt covering the second and third completions: nothing may overtake the
        // first, which is still active.
        complete(&mut state, second, 0);
        complete(&mut state, third, 0);
        assert!(state.take_retired().is_none());

        complete(&mut state, first, 0);
        let mut order = Vec::new();
        while let Some(retired) = state.take_retired() {
            state.free_chain(retired.head).unwrap();
            order.push(retired.completion.length);
        }
        assert_eq!(order, vec![100, 200, 300]);
        assert!(state.followups().is_empty());
    }

    #[test]
    fn other_pipes_are_not_blocked() {
        let (mut state, device) = state_with_device();
        let slow = bulk_pipe(&mut state, device, 1);
        let fast = bulk_pipe(&mut state, device, 2);
        queue(&mut state, slow, 10);
        let done = queue(&mut state, fast, 20);
        complete(&mut state, done, 0);

        let retired = state.take_retired().unwrap();
        assert_eq!(retired.completion.pipe, fast);
        assert_eq!(retired.completion.device, device);
        assert_eq!(retired.completion.status, Ok(()));
        assert_eq!(retired.completion.actual, 20);
        assert!(state.take_retired().is_none());
    }

    #[test]
    fn short_packet_retires_early() {
        let (mut state, device) = state_with_device();
        let pipe = bulk_pipe(&mut state, device, 1);
        let head = queue(&mut state, pipe, 40_000);
        let chain = state.chain(head);

        // The first qTD comes back 1000 bytes short; the rest never runs.
        let qtd = &mut state.transfers.get_mut(chain[0]).unwrap().qtd;
        let token = qtd.token.read() & !(QTD_TOKEN_ACTIVE | QTD_TOKEN_BYTES_MASK);
        qtd.token.write(token | (1000 << 16));

        let retired = state.take_retired().unwrap();
        assert_eq!(retired.completion.length, 40_000);
        assert_eq!(retired.completion.actual, 40_000 - 1000 - 16384 - 7232);
        for id in chain.iter() {
            assert!(!state.transfers.get(*id).unwrap().qtd.is_active());
        }
    }

    #[test]
    fn halt_reports_and_restarts_queue() {
        let (mut state, device) = state_with_device();
        let control = state.device(device).unwrap().control.unwrap();
        let head = state.pipes.get(control).unwrap().halt.unwrap();
        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18);
        state.queue_control(control, &setup, leaked(18)).unwrap();
        let next = state.pipes.get(control).unwrap().halt.unwrap();
        state.queue_control(control, &setup, leaked(18)).unwrap();

        // STALL on the data stage.
        let chain = state.chain(head);
        let setup_qtd = &mut state.transfers.get_mut(chain[0]).unwrap().qtd;
        let token = setup_qtd.token.read() & !(QTD_TOKEN_ACTIVE | QTD_TOKEN_BYTES_MASK);
        setup_qtd.token.write(token);
        let data = &mut state.transfers.get_mut(chain[1]).unwrap().qtd;
        let token = data.token.read() & !QTD_TOKEN_ACTIVE;
        data.token.write(token | QTD_TOKEN_HALTED);
        state.pipes.get_mut(control).unwrap().qh.token.write(QTD_TOKEN_HALTED);

        let retired = state.take_retired().unwrap();
        assert_eq!(retired.completion.status, Err(TransferError::Stall));
        assert_eq!(retired.completion.setup, Some(setup));
        assert_eq!(retired.callback, PipeCallback::Enumeration);
        assert_eq!(retired.completion.actual, 0);

        let qh = &state.pipes.get(control).unwrap().qh;
        assert!(!qh.is_halted());
        assert_eq!(qh.next.read(), state.transfers.get(next).unwrap().qtd.phys());
    }

    fn finish(state: &mut HostState, id: TransferId, remaining: u32) {
        let qtd = &mut state.transfers.get_mut(id).unwrap().qtd;
        let token = qtd.token.read() & !(QTD_TOKEN_ACTIVE | QTD_TOKEN_BYTES_MASK);
        qtd.token.write(token | (remaining << 16));
    }

    #[test]
    fn short_control_data_goes_to_status() {
        let (mut state, device) = state_with_device();
        let control = state.device(device).unwrap().control.unwrap();
        let head = state.pipes.get(control).unwrap().halt.unwrap();
        let setup = Setup {
            kind: 0x80,
            request: 6,
            value: 0x0200,
            index: 0,
            length: 20_000,
        };
        state.queue_control(control, &setup, leaked(20_000)).unwrap();
        let behind = state.pipes.get(control).unwrap().halt.unwrap();
        state.queue_control(control, &setup, leaked(20_000)).unwrap();

        // SETUP, two data qTDs, STATUS. The first data qTD is short, the second never runs.
        let chain = state.chain(head);
        assert_eq!(chain.len(), 4);
        finish(&mut state, chain[0], 0);
        finish(&mut state, chain[1], 100);
        assert!(state.take_retired().is_none());

        finish(&mut state, chain[3], 0);
        let retired = state.take_retired().unwrap();
        assert_eq!(retired.head, head);
        assert_eq!(retired.completion.status, Ok(()));
        assert_eq!(retired.completion.actual, 20_000 - 100 - (20_000 - 16_384));
        assert!(!state.transfers.get(chain[2]).unwrap().qtd.is_active());
        state.free_chain(retired.head).unwrap();

        // The chain queued behind it is no longer held up.
        let second = state.chain(behind);
        for id in second.iter() {
            finish(&mut state, *id, 0);
        }
        let retired = state.take_retired().unwrap();
        assert_eq!(retired.head, behind);
        assert_eq!(retired.completion.actual, 20_000);
    }
}
