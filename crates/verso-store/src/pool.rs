//! Fixed-size aligned page buffers with a bounded budget.
//!
//! All record data lives in pool pages: column-map main pages borrow one
//! buffer each, log chunks charge the budget without borrowing bytes (their
//! entries are typed slots). Alignment is achieved by over-allocating a
//! `Vec<u8>` and slicing at the first aligned offset; no `unsafe` is
//! required. Dropping a [`PageBuf`] returns the backing allocation to the
//! pool for reuse.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use verso_error::{Result, VersoError};

/// Size of every page handed out by the pool.
pub const PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Alignment of the usable region of a page.
pub const PAGE_ALIGN: usize = 4096;

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    /// Pages currently charged against the budget (buffers and
    /// reservations alike).
    charged: AtomicUsize,
    max_pages: usize,
}

impl PoolInner {
    fn charge(&self) -> Result<()> {
        let mut current = self.charged.load(Ordering::Relaxed);
        loop {
            if current >= self.max_pages {
                return Err(VersoError::OutOfMemory { resource: "pages" });
            }
            match self.charged.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    fn release(&self) {
        self.charged.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Source of uniformly sized, aligned, zeroed pages.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<PoolInner>,
}

impl PagePool {
    #[must_use]
    pub fn new(max_pages: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                charged: AtomicUsize::new(0),
                max_pages,
            }),
        }
    }

    /// Allocate a zeroed page buffer, reusing a returned one when possible.
    pub fn alloc(&self) -> Result<PageBuf> {
        self.inner.charge()?;
        let backing = self.inner.free.lock().pop();
        let (backing, offset) = match backing {
            Some(mut buf) => {
                let offset = aligned_offset(&buf);
                buf[offset..offset + PAGE_SIZE].fill(0);
                (buf, offset)
            }
            None => {
                let buf = vec![0u8; PAGE_SIZE + PAGE_ALIGN];
                let offset = aligned_offset(&buf);
                (buf, offset)
            }
        };
        Ok(PageBuf {
            backing: Some(backing),
            offset,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Charge one page of budget without borrowing bytes. Used by log
    /// chunks, whose entries are typed slots rather than raw pages.
    pub fn reserve(&self) -> Result<PageReservation> {
        self.inner.charge()?;
        Ok(PageReservation {
            pool: Arc::clone(&self.inner),
        })
    }

    /// Pages currently charged against the budget.
    #[must_use]
    pub fn charged(&self) -> usize {
        self.inner.charged.load(Ordering::Relaxed)
    }
}

fn aligned_offset(buf: &[u8]) -> usize {
    let addr = buf.as_ptr() as usize;
    align_offset_for(addr)
}

#[inline]
fn align_offset_for(addr: usize) -> usize {
    let rem = addr % PAGE_ALIGN;
    if rem == 0 {
        0
    } else {
        PAGE_ALIGN - rem
    }
}

/// Owned, page-sized, aligned buffer. Returned to the pool on drop.
pub struct PageBuf {
    /// `None` only transiently during `Drop`.
    backing: Option<Vec<u8>>,
    offset: usize,
    pool: Arc<PoolInner>,
}

impl PageBuf {
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let backing = self.backing.as_ref().expect("PageBuf backing consumed");
        &backing[self.offset..self.offset + PAGE_SIZE]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let backing = self.backing.as_mut().expect("PageBuf backing consumed");
        &mut backing[self.offset..self.offset + PAGE_SIZE]
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        if let Some(backing) = self.backing.take() {
            self.pool.free.lock().push(backing);
        }
        self.pool.release();
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuf").field("offset", &self.offset).finish()
    }
}

/// Budget charge for a page-sized allocation that lives outside the pool's
/// buffers. Released on drop.
pub struct PageReservation {
    pool: Arc<PoolInner>,
}

impl Drop for PageReservation {
    fn drop(&mut self) {
        self.pool.release();
    }
}

impl std::fmt::Debug for PageReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReservation").finish()
    }
}
