use std::cell::RefCell;

std::thread_local! {
    static CAPTURED: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// putchar-compatible symbol that records every byte in a thread-local
/// buffer instead of writing to stdout. Shared by both engines so PRINT
/// streams can be compared.
pub extern "C" fn capture_putchar(c: libc::c_int) -> libc::c_int {
    CAPTURED.with(|buffer| buffer.borrow_mut().push(c as u8));
    c
}

pub fn take_captured() -> Vec<u8> {
    CAPTURED.with(|buffer| std::mem::take(&mut *buffer.borrow_mut()))
}
