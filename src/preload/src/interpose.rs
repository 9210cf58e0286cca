use crate::hooks;

/// One entry of dyld's interposition table.
#[repr(C)]
pub struct Interpose {
    replacement: *const (),
    original: *const (),
}

unsafe impl Sync for Interpose {}

extern "C" {
    // bridge.c
    fn autopen_open_bridge(path: *const libc::c_char, oflag: libc::c_int, ...) -> libc::c_int;
}

macro_rules! interpose {
    ($($name:ident: $replacement:path => $original:path;)*) => {
        $(
            #[used]
            #[link_section = "__DATA,__interpose"]
            static $name: Interpose = Interpose {
                replacement: $replacement as *const (),
                original: $original as *const (),
            };
        )*
    };
}

interpose! {
    INTERPOSE_OPEN: autopen_open_bridge => libc::open;
    INTERPOSE_CLOSE: hooks::autopen_close => libc::close;
    INTERPOSE_READ: hooks::autopen_read => libc::read;
    INTERPOSE_FSTAT: hooks::autopen_fstat => libc::fstat;
    INTERPOSE_DIGEST_UPDATE: hooks::autopen_digest_update => hooks::CCDigestUpdate;
    INTERPOSE_DIGEST_FINAL: hooks::autopen_digest_final => hooks::CCDigestFinal;
}
