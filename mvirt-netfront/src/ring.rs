//! Shared ring index discipline
//!
//! One page holds a 64 byte header (`req_prod`, `req_event`, `rsp_prod`,
//! `rsp_event`, padding) followed by a power-of-two array of fixed-size
//! slots. A slot carries either a request (written by the front-end) or, once
//! the backend has consumed it, the matching response.
//!
//! `FrontRing` is the producer of requests and consumer of responses;
//! `BackRing` is the backend's view used by the simulated backend domain.
//! Both keep private copies of their producer index and only publish them on
//! push, so a batch of slots costs one index write and at most one
//! notification.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

use crate::memory::Page;
use crate::protocol::{
    PAGE_SIZE, RingIdx, SRING_HEADER_SIZE, SRING_REQ_EVENT, SRING_REQ_PROD, SRING_RSP_EVENT,
    SRING_RSP_PROD, ring_size,
};

/// Notification predicate shared by both ring ends.
///
/// The peer asked to be woken once the producer index passes `event`; after
/// moving the index from `old` to `new` a notification is due if `event`
/// lies in `(old, new]`.
pub fn ring_need_notify(event: RingIdx, new: RingIdx, old: RingIdx) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

fn read_index(mem: &GuestMemoryMmap, base: GuestAddress, offset: u64) -> Result<RingIdx, GuestMemoryError> {
    mem.read_obj(GuestAddress(base.0 + offset))
}

fn write_index(
    mem: &GuestMemoryMmap,
    base: GuestAddress,
    offset: u64,
    value: RingIdx,
) -> Result<(), GuestMemoryError> {
    mem.write_obj(value, GuestAddress(base.0 + offset))
}

fn slot_address(base: GuestAddress, size: u32, slot_size: usize, idx: RingIdx) -> GuestAddress {
    let slot = (idx & (size - 1)) as u64;
    GuestAddress(base.0 + SRING_HEADER_SIZE as u64 + slot * slot_size as u64)
}

/// Lifecycle state of one receive or transmit ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Disconnected,
    Connected,
    /// Posting requests and polling responses
    Enabled,
    /// Out of buffers; waiting for the consumer to return some
    Stopped,
    /// No new requests; responses still drained
    Disabled,
    /// Protocol violation seen; only teardown is allowed
    Failed,
}

impl RingState {
    pub fn name(self) -> &'static str {
        match self {
            RingState::Disconnected => "disconnected",
            RingState::Connected => "connected",
            RingState::Enabled => "enabled",
            RingState::Stopped => "stopped",
            RingState::Disabled => "disabled",
            RingState::Failed => "failed",
        }
    }

    /// Responses may still arrive
    pub fn is_polling(self) -> bool {
        matches!(
            self,
            RingState::Enabled | RingState::Stopped | RingState::Disabled
        )
    }
}

impl std::fmt::Display for RingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Front-end (request producer) side of a shared ring.
pub struct FrontRing {
    page: Page,
    size: u32,
    slot_size: usize,
    /// Requests written but not yet published
    req_prod_pvt: RingIdx,
    /// Next response to consume
    rsp_cons: RingIdx,
}

impl FrontRing {
    /// Initialise the shared page and attach the front-end to it.
    ///
    /// The page is zeroed and both event indices set to 1 so that the first
    /// request and the first response each raise a notification.
    pub fn new(page: Page, slot_size: usize) -> Result<Self, GuestMemoryError> {
        page.zero(0, PAGE_SIZE)?;

        let ring = Self {
            size: ring_size(slot_size),
            slot_size,
            page,
            req_prod_pvt: 0,
            rsp_cons: 0,
        };
        ring.write_shared(SRING_REQ_EVENT, 1)?;
        ring.write_shared(SRING_RSP_EVENT, 1)?;

        Ok(ring)
    }

    /// Reset indices after the backend has gone away and re-initialise the page.
    pub fn reset(&mut self) -> Result<(), GuestMemoryError> {
        self.page.zero(0, PAGE_SIZE)?;
        self.req_prod_pvt = 0;
        self.rsp_cons = 0;
        self.write_shared(SRING_REQ_EVENT, 1)?;
        self.write_shared(SRING_RSP_EVENT, 1)
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn req_prod_pvt(&self) -> RingIdx {
        self.req_prod_pvt
    }

    pub fn rsp_cons(&self) -> RingIdx {
        self.rsp_cons
    }

    /// Slots available for new requests
    pub fn free_requests(&self) -> u32 {
        self.size - self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Requests produced (published or not) whose responses are not yet consumed
    pub fn outstanding(&self) -> u32 {
        self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Slot index the next request will occupy
    pub fn next_request_slot(&self) -> u32 {
        self.req_prod_pvt & (self.size - 1)
    }

    /// Write a request into the next private slot.
    pub fn write_request<T: ByteValued>(&mut self, request: T) -> Result<RingIdx, GuestMemoryError> {
        debug_assert!(std::mem::size_of::<T>() <= self.slot_size);
        debug_assert!(self.free_requests() > 0);

        let idx = self.req_prod_pvt;
        let addr = slot_address(self.page.addr(), self.size, self.slot_size, idx);
        self.page.memory().write_obj(request, addr)?;
        self.req_prod_pvt = idx.wrapping_add(1);
        Ok(idx)
    }

    /// Publish private requests.
    ///
    /// Returns true if the backend asked to be notified for any of them.
    pub fn push_requests(&mut self) -> Result<bool, GuestMemoryError> {
        let old = self.read_shared(SRING_REQ_PROD)?;
        let new = self.req_prod_pvt;

        // Slot contents must be visible before the producer index
        fence(Ordering::Release);
        self.write_shared(SRING_REQ_PROD, new)?;
        fence(Ordering::SeqCst);

        let event = self.read_shared(SRING_REQ_EVENT)?;
        Ok(ring_need_notify(event, new, old))
    }

    /// Shared response producer index
    pub fn rsp_prod(&self) -> Result<RingIdx, GuestMemoryError> {
        let prod = self.read_shared(SRING_RSP_PROD)?;
        // Responses up to prod must be read after the index
        fence(Ordering::Acquire);
        Ok(prod)
    }

    pub fn unconsumed_responses(&self) -> Result<u32, GuestMemoryError> {
        Ok(self.rsp_prod()?.wrapping_sub(self.rsp_cons))
    }

    /// Read the response at `rsp_cons` and advance the consumer.
    pub fn read_response<T: ByteValued>(&mut self) -> Result<T, GuestMemoryError> {
        let addr = slot_address(self.page.addr(), self.size, self.slot_size, self.rsp_cons);
        let response = self.page.memory().read_obj(addr)?;
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Ok(response)
    }

    /// Re-arm the response event and re-check for work.
    ///
    /// Closes the race where the backend produces a response between the
    /// consumer's last check and the event write.
    pub fn final_check_for_responses(&mut self) -> Result<bool, GuestMemoryError> {
        if self.unconsumed_responses()? != 0 {
            return Ok(true);
        }
        self.write_shared(SRING_RSP_EVENT, self.rsp_cons.wrapping_add(1))?;
        fence(Ordering::SeqCst);
        Ok(self.unconsumed_responses()? != 0)
    }

    /// Write a response slot locally.
    ///
    /// Only used to fabricate responses when the backend can no longer
    /// reply; `publish_responses` makes them visible to `read_response`.
    pub fn write_response_at<T: ByteValued>(
        &self,
        idx: RingIdx,
        response: T,
    ) -> Result<(), GuestMemoryError> {
        let addr = slot_address(self.page.addr(), self.size, self.slot_size, idx);
        self.page.memory().write_obj(response, addr)
    }

    pub fn publish_responses(&self, rsp_prod: RingIdx) -> Result<(), GuestMemoryError> {
        fence(Ordering::Release);
        self.write_shared(SRING_RSP_PROD, rsp_prod)
    }

    fn read_shared(&self, offset: u64) -> Result<RingIdx, GuestMemoryError> {
        read_index(self.page.memory(), self.page.addr(), offset)
    }

    fn write_shared(&self, offset: u64, value: RingIdx) -> Result<(), GuestMemoryError> {
        write_index(self.page.memory(), self.page.addr(), offset, value)
    }
}

/// Backend (response producer) side of a shared ring.
pub struct BackRing {
    mem: Arc<GuestMemoryMmap>,
    base: GuestAddress,
    size: u32,
    slot_size: usize,
    rsp_prod_pvt: RingIdx,
    req_cons: RingIdx,
}

impl BackRing {
    /// Attach to a ring page already initialised by the front-end.
    pub fn attach(mem: Arc<GuestMemoryMmap>, base: GuestAddress, slot_size: usize) -> Self {
        Self {
            mem,
            base,
            size: ring_size(slot_size),
            slot_size,
            rsp_prod_pvt: 0,
            req_cons: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn req_cons(&self) -> RingIdx {
        self.req_cons
    }

    pub fn rsp_prod_pvt(&self) -> RingIdx {
        self.rsp_prod_pvt
    }

    /// Requests published by the front-end and not yet consumed
    pub fn unconsumed_requests(&self) -> Result<u32, GuestMemoryError> {
        let req_prod = read_index(&self.mem, self.base, SRING_REQ_PROD)?;
        fence(Ordering::Acquire);
        let published = req_prod.wrapping_sub(self.req_cons);
        let room = self.size - self.req_cons.wrapping_sub(self.rsp_prod_pvt);
        Ok(published.min(room))
    }

    pub fn read_request<T: ByteValued>(&mut self) -> Result<T, GuestMemoryError> {
        let addr = slot_address(self.base, self.size, self.slot_size, self.req_cons);
        let request = self.mem.read_obj(addr)?;
        self.req_cons = self.req_cons.wrapping_add(1);
        Ok(request)
    }

    pub fn write_response<T: ByteValued>(&mut self, response: T) -> Result<(), GuestMemoryError> {
        let addr = slot_address(self.base, self.size, self.slot_size, self.rsp_prod_pvt);
        self.mem.write_obj(response, addr)?;
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
        Ok(())
    }

    /// Publish private responses; returns true if the front-end wants an event.
    pub fn push_responses(&mut self) -> Result<bool, GuestMemoryError> {
        let old = read_index(&self.mem, self.base, SRING_RSP_PROD)?;
        let new = self.rsp_prod_pvt;

        fence(Ordering::Release);
        write_index(&self.mem, self.base, SRING_RSP_PROD, new)?;
        fence(Ordering::SeqCst);

        let event = read_index(&self.mem, self.base, SRING_RSP_EVENT)?;
        Ok(ring_need_notify(event, new, old))
    }

    /// Re-arm the request event and re-check for work.
    pub fn final_check_for_requests(&mut self) -> Result<bool, GuestMemoryError> {
        if self.unconsumed_requests()? != 0 {
            return Ok(true);
        }
        write_index(
            &self.mem,
            self.base,
            SRING_REQ_EVENT,
            self.req_cons.wrapping_add(1),
        )?;
        fence(Ordering::SeqCst);
        Ok(self.unconsumed_requests()? != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FramePool, create_guest_memory};
    use crate::protocol::{RX_SLOT_SIZE, RxRequest, RxResponse, TX_SLOT_SIZE, TxRequest};

    fn test_pool() -> Arc<FramePool> {
        let mem = Arc::new(create_guest_memory(16 * PAGE_SIZE).expect("memory"));
        FramePool::new(mem, 0, 16)
    }

    #[test]
    fn test_ring_need_notify() {
        // Event at 1, moved from 0 to 1 -> notify
        assert!(ring_need_notify(1, 1, 0));
        // Event at 5, moved from 0 to 3 -> no notify yet
        assert!(!ring_need_notify(5, 3, 0));
        // Event at 5, moved from 3 to 8 -> notify
        assert!(ring_need_notify(5, 8, 3));
        // Wraparound
        assert!(ring_need_notify(u32::MAX, 1, u32::MAX - 1));
    }

    #[test]
    fn test_front_ring_init() {
        let pool = test_pool();
        let ring = FrontRing::new(pool.alloc().expect("page"), TX_SLOT_SIZE).expect("ring");

        assert_eq!(ring.size(), 256);
        assert_eq!(ring.free_requests(), 256);
        assert_eq!(ring.read_shared(SRING_REQ_EVENT).expect("read"), 1);
        assert_eq!(ring.read_shared(SRING_RSP_EVENT).expect("read"), 1);
    }

    #[test]
    fn test_push_notifies_once_per_event() {
        let pool = test_pool();
        let mut front = FrontRing::new(pool.alloc().expect("page"), RX_SLOT_SIZE).expect("ring");

        front
            .write_request(RxRequest { id: 0, pad: 0, gref: 7 })
            .expect("write");
        // req_event = 1: first publish notifies
        assert!(front.push_requests().expect("push"));

        front
            .write_request(RxRequest { id: 1, pad: 0, gref: 8 })
            .expect("write");
        // Backend has not re-armed req_event, so no notification
        assert!(!front.push_requests().expect("push"));
        assert_eq!(front.free_requests(), 254);
    }

    #[test]
    fn test_request_response_round() {
        let pool = test_pool();
        let mut front = FrontRing::new(pool.alloc().expect("page"), RX_SLOT_SIZE).expect("ring");
        let mut back = BackRing::attach(
            Arc::clone(pool.memory()),
            front.page().addr(),
            RX_SLOT_SIZE,
        );

        for id in 0..3u16 {
            front
                .write_request(RxRequest {
                    id,
                    pad: 0,
                    gref: 100 + id as u32,
                })
                .expect("write");
        }
        front.push_requests().expect("push");

        assert_eq!(back.unconsumed_requests().expect("unconsumed"), 3);
        for id in 0..3u16 {
            let req: RxRequest = back.read_request().expect("read");
            assert_eq!(req.id, id);
            assert_eq!(req.gref, 100 + id as u32);
            back.write_response(RxResponse {
                id,
                offset: 0,
                flags: 0,
                status: 60,
            })
            .expect("write");
        }
        // rsp_event = 1: first publish notifies the front-end
        assert!(back.push_responses().expect("push"));

        assert_eq!(front.unconsumed_responses().expect("unconsumed"), 3);
        for id in 0..3u16 {
            let rsp: RxResponse = front.read_response().expect("read");
            assert_eq!(rsp.id, id);
            assert_eq!(rsp.status, 60);
        }
        assert_eq!(front.free_requests(), 256);
        assert!(!front.final_check_for_responses().expect("final check"));
    }

    #[test]
    fn test_back_ring_respects_room() {
        let pool = test_pool();
        let mut front = FrontRing::new(pool.alloc().expect("page"), TX_SLOT_SIZE).expect("ring");
        let back = BackRing::attach(
            Arc::clone(pool.memory()),
            front.page().addr(),
            TX_SLOT_SIZE,
        );

        while front.free_requests() > 0 {
            front.write_request(TxRequest::default()).expect("write");
        }
        front.push_requests().expect("push");
        assert_eq!(back.unconsumed_requests().expect("unconsumed"), 256);
    }
}
