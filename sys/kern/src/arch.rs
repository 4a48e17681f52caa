// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names.

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "none", target_arch = "arm"))] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("support for this architecture not implemented");
    } else {
        // Hosted build: the kernel logic runs under the native test
        // harness against a simulated machine.
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
