// SPDX-License-Identifier: GPL-3.0-only

//! Scheduling of buffer presentation requests.
//!
//! Clients ask for a pixmap to be shown on a window at a given frame counter
//! value. The [`present::PresentScreen`] scheduler waits for that frame, then
//! either flips the pixmap into scanout or copies it into the window, and
//! reports completion and idleness back. What "scanout" means is up to the
//! [`backend::PresentBackend`] in use: a display device with real vblank
//! events, or a compositor where vblank has to be emulated.

pub mod backend;
pub mod config;
pub mod headless;
pub mod present;
pub mod utils;
pub mod window;
