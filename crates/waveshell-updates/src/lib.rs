//! Domain types shared across the core (`RemotePtr`, `CmdType`, ...), the [`Store`]
//! persistence trait and its in-memory test double, and the update/user-input buses that
//! carry data out to attached UI frontends (spec.md §6).

pub mod bus;
pub mod model;
pub mod store;

pub use bus::{user_input_channel, UpdateBus, UserInputBus, UserInputSlot};
pub use model::{
    ClientData, CmdStatus, CmdType, RemoteInstance, RemotePtr, ScreenType, Update,
    UserInputRequest, UserInputResponse,
};
pub use store::{MemoryStore, Store, StoreError};
