// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process IPC patterns over named shared memory, named mutexes, and
// named semaphores: a file-backed shared region with advisory write
// locking, a versioned key-value store, latest-value publish/subscribe,
// and bounded FIFO/LIFO/DEQUE dispensers. A C-ABI facade exposes the
// patterns to thin client-language bindings.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod semaphore;
pub use semaphore::IpcSemaphore;

mod lock;
pub use lock::AdvisoryLock;

mod region;
pub use region::SharedRegion;

mod store_dict;
pub use store_dict::{DictEntry, StoreDict};

mod pubsub;
pub use pubsub::{MessageHandler, PubSub};

mod dispenser;
pub use dispenser::{DispenserMode, ShmDispenser};

mod pipe;
pub use pipe::NamedPipe;

mod reqresp;
pub use reqresp::{ReqResp, RequestHandler};

mod pipe_dispenser;
pub use pipe_dispenser::PipeDispenser;

pub mod ffi;
