//! Coordination between tabs of the same origin.
//!
//! - [`login`]: a fresh login in one tab wakes anonymous tabs waiting for it.
//! - [`logout`]: a logout in one tab logs every other tab out, exactly once.
//! - [`activity`]: user interaction anywhere keeps every tab's session alive.
//! - [`countdown`]: auto-logout after a period without interaction.

pub mod activity;
pub mod countdown;
pub mod login;
pub mod logout;
