use common::io::Io;
use log::{debug, error, trace};
use smallvec::SmallVec;

use super::qh::{capabilities, Characteristics, QueueHead};
use super::qtd::LINK_TERMINATE;
use super::transfer::{Transfer, TransferId};
use super::{HostState, FRAME_LIST_LEN};
use crate::driver_interface::{
    DeviceId, Direction, Error, PipeCallback, PipeId, PipeType, Resource, Result,
};

/// Frames a periodic queue head must stay untouched after unlinking: the controller may have
/// cached it for the frame in progress.
pub const PERIODIC_RECLAIM_FRAMES: u32 = 2;

/// Frame numbers sampled from FRINDEX wrap at 2048.
const FRAME_MASK: u32 = 0x7FF;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipeState {
    /// Reachable by the controller through the async ring or the periodic tree.
    Linked,
    /// Off the schedule, waiting for the controller to confirm it has let go.
    Unlinking,
}

pub struct Pipe {
    pub(crate) qh: QueueHead,
    pub(crate) device: Option<DeviceId>,
    pub(crate) ty: PipeType,
    pub(crate) direction: Direction,
    /// The inactive qTD the queue ends in. New chains are appended by turning it into their
    /// first element.
    pub(crate) halt: Option<TransferId>,
    pub(crate) callback: PipeCallback,
    pub(crate) state: PipeState,
    /// Successor in the async ring or the periodic list, mirroring the horizontal link.
    pub(crate) next: Option<PipeId>,
    pub(crate) reclaim_next: Option<PipeId>,
    /// Heads of chains cancelled while the pipe was linked, freed with it.
    pub(crate) cancelled: Option<TransferId>,
    pub(crate) unlinked_frame: u32,
}

impl Default for Pipe {
    fn default() -> Self {
        Self {
            qh: QueueHead::default(),
            device: None,
            ty: PipeType::Control,
            direction: Direction::Out,
            halt: None,
            callback: PipeCallback::None,
            state: PipeState::Unlinking,
            next: None,
            reclaim_next: None,
            cancelled: None,
            unlinked_frame: 0,
        }
    }
}

impl Pipe {
    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub fn ty(&self) -> PipeType {
        self.ty
    }

    /// Polling interval in frames, as placed in the periodic tree.
    pub fn interval(&self) -> u16 {
        match self.ty {
            PipeType::Interrupt { interval } | PipeType::Isochronous { interval } => {
                schedule_interval(interval)
            }
            PipeType::Control | PipeType::Bulk => 0,
        }
    }
}

/// The largest power of two not above `interval`, within the frame list length.
pub fn schedule_interval(interval: u16) -> u16 {
    let interval = interval.clamp(1, FRAME_LIST_LEN as u16);
    1 << (15 - interval.leading_zeros())
}

/// Unlinked pipes waiting for the controller. `batch` is covered by the doorbell currently rung,
/// `pending` waits for the next one.
#[derive(Default)]
pub struct Reclaim {
    pub(crate) batch: Option<PipeId>,
    pub(crate) pending: Option<PipeId>,
    pub(crate) doorbell: bool,
    /// Set when a doorbell has to be rung before the critical section ends.
    pub(crate) ring: bool,
}

impl HostState {
    pub(crate) fn pipe(&self, id: PipeId) -> Result<&Pipe> {
        match self.pipes.get(id) {
            Some(pipe) if pipe.state == PipeState::Linked => Ok(pipe),
            _ => Err(Error::NoSuchPipe),
        }
    }

    pub(crate) fn pipe_mut(&mut self, id: PipeId) -> Result<&mut Pipe> {
        match self.pipes.get_mut(id) {
            Some(pipe) if pipe.state == PipeState::Linked => Ok(pipe),
            _ => Err(Error::NoSuchPipe),
        }
    }

    pub(crate) fn create_pipe(
        &mut self,
        device_id: DeviceId,
        ty: PipeType,
        endpoint: u8,
        direction: Direction,
        max_packet: u16,
        callback: PipeCallback,
    ) -> Result<PipeId> {
        if let PipeType::Isochronous { .. } = ty {
            return Err(Error::Unsupported("isochronous pipes"));
        }
        if max_packet > 1024 {
            return Err(Error::Unsupported("max packet size above 1024"));
        }
        let device = self.device(device_id)?;
        let chars = Characteristics {
            address: device.address,
            endpoint: endpoint & 0x0F,
            speed: device.speed,
            max_packet,
            control: ty == PipeType::Control,
            periodic: ty.is_periodic(),
        };
        let caps = capabilities(
            device.tt.0,
            device.tt.1,
            ty.is_periodic(),
            device.is_split(),
        );

        let halt = self
            .transfers
            .alloc(Transfer::default())
            .ok_or(Error::ResourceExhausted(Resource::Transfers))?;
        let pipe = Pipe {
            device: Some(device_id),
            ty,
            direction,
            halt: Some(halt),
            callback,
            state: PipeState::Linked,
            ..Pipe::default()
        };
        let id = match self.pipes.alloc(pipe) {
            Some(id) => id,
            None => {
                self.transfers.free(halt)?;
                return Err(Error::ResourceExhausted(Resource::Pipes));
            }
        };

        let halt_phys = match self.transfers.get_mut(halt) {
            Some(transfer) => {
                transfer.qtd.halt();
                transfer.qtd.phys()
            }
            None => return Err(Error::NoSuchPipe),
        };
        if let Some(pipe) = self.pipes.get_mut(id) {
            pipe.qh.init(chars.bits(), caps, halt_phys);
        }

        if ty.is_periodic() {
            self.link_periodic(id);
        } else {
            self.link_async(id);
        }
        debug!(
            "pipe {:?}: {:?} endpoint {} {:?} of device {:?}, max packet {}",
            id, ty, endpoint, direction, device_id, max_packet
        );
        Ok(id)
    }

    fn link_async(&mut self, id: PipeId) {
        let first = self.async_first;
        let head_link = self.async_head.horizontal.read();
        let link = match self.pipes.get_mut(id) {
            Some(pipe) => {
                pipe.qh.horizontal.write(head_link);
                pipe.next = first;
                pipe.qh.link()
            }
            None => return,
        };
        self.async_head.horizontal.write(link);
        self.async_first = Some(id);
    }

    fn link_periodic(&mut self, id: PipeId) {
        let interval = match self.pipes.get(id) {
            Some(pipe) => pipe.interval(),
            None => return,
        };

        // Keep the list sorted by descending interval: insert after the last pipe polled at
        // least as rarely.
        let mut pred = None;
        let mut cursor = self.periodic_first;
        while let Some(current) = cursor {
            match self.pipes.get(current) {
                Some(pipe) if pipe.interval() >= interval => {
                    pred = Some(current);
                    cursor = pipe.next;
                }
                _ => break,
            }
        }
        let successor_link = cursor
            .and_then(|next| self.pipes.get(next))
            .map_or(LINK_TERMINATE, |pipe| pipe.qh.link());

        let link = match self.pipes.get_mut(id) {
            Some(pipe) => {
                pipe.qh.horizontal.write(successor_link);
                pipe.next = cursor;
                pipe.qh.link()
            }
            None => return,
        };
        match pred.and_then(|pred| self.pipes.get_mut(pred)) {
            Some(pred) => {
                pred.qh.horizontal.write(link);
                pred.next = Some(id);
            }
            None => self.periodic_first = Some(id),
        }
        self.rebuild_frame_list();
    }

    /// Points every frame list slot at the first queue head whose interval divides the slot.
    pub(crate) fn rebuild_frame_list(&mut self) {
        let mut order: SmallVec<[(u16, u32); 16]> = SmallVec::new();
        let mut cursor = self.periodic_first;
        while let Some(pipe) = cursor.and_then(|id| self.pipes.get(id)) {
            order.push((pipe.interval(), pipe.qh.link()));
            cursor = pipe.next;
        }
        for (slot, entry) in self.periodic.0.iter_mut().enumerate() {
            let link = order
                .iter()
                .find(|(interval, _)| slot % usize::from(*interval) == 0)
                .map_or(LINK_TERMINATE, |(_, link)| *link);
            if entry.read() != link {
                entry.write(link);
            }
        }
    }

    fn unlink_async(&mut self, id: PipeId) {
        let (horizontal, next) = match self.pipes.get(id) {
            Some(pipe) => (pipe.qh.horizontal.read(), pipe.next),
            None => return,
        };
        if self.async_first == Some(id) {
            self.async_head.horizontal.write(horizontal);
            self.async_first = next;
            return;
        }
        let mut cursor = self.async_first;
        while let Some(current) = cursor {
            let pipe = match self.pipes.get_mut(current) {
                Some(pipe) => pipe,
                None => break,
            };
            if pipe.next == Some(id) {
                pipe.qh.horizontal.write(horizontal);
                pipe.next = next;
                return;
            }
            cursor = pipe.next;
        }
        error!("pipe {:?} not found on the async ring", id);
    }

    fn unlink_periodic(&mut self, id: PipeId) {
        let (horizontal, next) = match self.pipes.get(id) {
            Some(pipe) => (pipe.qh.horizontal.read(), pipe.next),
            None => return,
        };
        if self.periodic_first == Some(id) {
            self.periodic_first = next;
        } else {
            let mut cursor = self.periodic_first;
            while let Some(current) = cursor {
                let pipe = match self.pipes.get_mut(current) {
                    Some(pipe) => pipe,
                    None => break,
                };
                if pipe.next == Some(id) {
                    pipe.qh.horizontal.write(horizontal);
                    pipe.next = next;
                    break;
                }
                cursor = pipe.next;
            }
        }
        self.rebuild_frame_list();
    }

    /// Takes the pipe off the schedule and queues it for reclamation. Outstanding chains are
    /// cancelled without completions.
    pub(crate) fn unlink_pipe(&mut self, id: PipeId) -> Result<()> {
        let periodic = self.pipe(id)?.ty.is_periodic();

        let mut cancelled = None;
        let mut cursor = self.followup.head;
        while let Some(head) = cursor {
            cursor = self.transfers.get(head).and_then(|t| t.next_followup);
            if self.chain_pipe(head) == Some(id) {
                self.followup_remove(head);
                if let Some(transfer) = self.transfers.get_mut(head) {
                    transfer.next_followup = cancelled;
                }
                cancelled = Some(head);
            }
        }

        if periodic {
            self.unlink_periodic(id);
        } else {
            self.unlink_async(id);
        }

        let frame = self.frame;
        let queue_next = if self.reclaim.doorbell {
            self.reclaim.pending
        } else {
            self.reclaim.batch
        };
        if let Some(pipe) = self.pipes.get_mut(id) {
            pipe.state = PipeState::Unlinking;
            pipe.cancelled = cancelled;
            pipe.unlinked_frame = frame;
            pipe.next = None;
            pipe.reclaim_next = queue_next;
        }
        if self.reclaim.doorbell {
            self.reclaim.pending = Some(id);
        } else {
            self.reclaim.batch = Some(id);
            self.reclaim.doorbell = true;
            self.reclaim.ring = true;
        }
        debug!("pipe {:?} unlinked at frame {}", id, frame);
        Ok(())
    }

    /// Runs on the async advance interrupt: releases the pipes the controller has confirmed it
    /// no longer references.
    pub(crate) fn reclaim(&mut self) {
        let frame = self.frame;
        let mut cursor = self.reclaim.batch.take();
        let mut waiting = self.reclaim.pending.take();
        while let Some(id) = cursor {
            let pipe = match self.pipes.get_mut(id) {
                Some(pipe) => pipe,
                None => break,
            };
            cursor = pipe.reclaim_next.take();
            if pipe.ty.is_periodic()
                && (frame.wrapping_sub(pipe.unlinked_frame) & FRAME_MASK) < PERIODIC_RECLAIM_FRAMES
            {
                pipe.reclaim_next = waiting;
                waiting = Some(id);
                continue;
            }
            if let Err(err) = self.release_pipe(id) {
                error!("failed to release pipe {:?}: {}", id, err);
            }
        }

        // Releasing a device can start the next enumeration, and a failing start unlinks again.
        let mut unlinked = self.reclaim.pending.take();
        while let Some(id) = unlinked {
            let Some(pipe) = self.pipes.get_mut(id) else {
                break;
            };
            unlinked = pipe.reclaim_next.take();
            pipe.reclaim_next = waiting;
            waiting = Some(id);
        }

        self.reclaim.batch = waiting;
        self.reclaim.doorbell = waiting.is_some();
        self.reclaim.ring = waiting.is_some();
    }

    fn release_pipe(&mut self, id: PipeId) -> Result<()> {
        let (halt, mut cancelled, device) = match self.pipes.get(id) {
            Some(pipe) => (pipe.halt, pipe.cancelled, pipe.device),
            None => return Err(Error::NoSuchPipe),
        };
        while let Some(head) = cancelled {
            cancelled = self.transfers.get(head).and_then(|t| t.next_followup);
            self.free_chain(head)?;
        }
        if let Some(halt) = halt {
            self.transfers.free(halt)?;
        }
        self.pipes.free(id)?;
        trace!("pipe {:?} reclaimed", id);
        if let Some(device) = device {
            self.free_detached(device);
        }
        Ok(())
    }

    pub(crate) fn set_pipe_address(&mut self, id: PipeId, address: u8) -> Result<()> {
        self.pipe_mut(id)?.qh.set_address(address);
        Ok(())
    }

    pub(crate) fn set_pipe_max_packet(&mut self, id: PipeId, max_packet: u16) -> Result<()> {
        self.pipe_mut(id)?.qh.set_max_packet(max_packet);
        Ok(())
    }

    /// Pipes the controller can reach through the async ring, in ring order.
    pub(crate) fn async_ring(&self) -> SmallVec<[PipeId; 16]> {
        let mut ring = SmallVec::new();
        let mut cursor = self.async_first;
        while let Some(id) = cursor {
            ring.push(id);
            cursor = self.pipes.get(id).and_then(|pipe| pipe.next);
        }
        ring
    }

    pub(crate) fn device_pipes(&self, device: DeviceId) -> SmallVec<[PipeId; 8]> {
        self.pipes
            .iter()
            .filter(|(_, pipe)| pipe.state == PipeState::Linked && pipe.device == Some(device))
            .map(|(id, _)| id)
            .collect()
    }
}
