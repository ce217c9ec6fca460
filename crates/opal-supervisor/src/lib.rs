// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Starts and supervises one process group per session: the [`opal_core`]
//! agent, its tool registry (including a wired-in sub-agent tool), and a
//! background task mirroring its turns into an [`opal_session::SessionTree`].
//!
//! Restart strategy is rest-for-one: a crashed downstream child (the
//! tree-mirroring bridge, currently the only task this crate itself spawns
//! and can observe) is snapshotted and restarted without touching the agent
//! or provider it depends on. See [`Supervisor::reconcile`].

mod bridge;
mod error;
mod group;
mod registry;

pub use error::{Result, SupervisorError};
pub use group::{SessionGroupInfo, SessionHandle};
pub use registry::{StartSessionSpec, Supervisor};
