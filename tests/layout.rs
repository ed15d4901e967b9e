//! Stack layout and the memory threads run on.

mod utils;

use spindle::stack::Layout;
use spindle::{ThreadConfig, default_stack_size};
use utils::Fixture;

#[test]
fn layout_rounds_to_pages() {
    let page = 4096;
    let layout = Layout::compute(3000, 100, page).unwrap();
    assert_eq!(layout.guard_size, page);
    assert_eq!(layout.stack_size, page);
    assert_eq!(layout.control_size, page);
    assert_eq!(layout.total, 3 * page);

    assert_eq!(layout.stack_bottom(), page);
    assert_eq!(layout.stack_top(), 2 * page);
    assert_eq!(layout.control_offset(), 2 * page);
}

#[test]
fn layout_control_only() {
    let page = 4096;
    let layout = Layout::control_only(page).unwrap();
    similar_asserts::assert_eq!(
        layout,
        Layout {
            guard_size: 0,
            stack_size: 0,
            control_size: page,
            total: page,
        }
    );
    assert_eq!(layout.control_offset(), 0);
}

#[test]
fn layout_overflow() {
    let page = 4096;
    assert_eq!(Layout::compute(usize::MAX, page, page), None);
    assert_eq!(Layout::compute(usize::MAX / 2, usize::MAX / 2, page), None);
}

#[test]
fn default_stack() {
    let f = Fixture::new();
    let thread = f
        .runtime
        .create(
            &ThreadConfig::new(),
            |_| {
                let local = 0_u8;
                std::hint::black_box(&local) as *const u8 as usize
            },
            0,
        )
        .unwrap();

    let info = f.runtime.stack(thread).unwrap();
    assert!(!info.custom);
    assert!(info.guard_size > 0);
    assert_eq!(info.guard_size, spindle::default_guard_size());
    assert_eq!(info.size(), default_stack_size());
    assert_eq!(info.bottom - info.guard_size, info.allocation_base);
    assert!(f.memory.is_reservation_base(info.allocation_base));
    assert!(f.memory.is_live(info.bottom));

    // The control block sits right above the stack.
    assert_eq!(thread.to_raw() as usize, info.top);

    let local = f.runtime.join(thread).unwrap();
    assert!(
        local >= info.bottom && local < info.top,
        "{local:#x} not in {info:x?}"
    );
}

#[test]
fn requested_sizes() {
    let f = Fixture::new();
    let page = f.runtime.page_size();

    let config = ThreadConfig::new()
        .stack_size(2 * default_stack_size())
        .guard_size(4 * page);
    let thread = f.runtime.create(&config, |_| 0, 0).unwrap();

    let info = f.runtime.stack(thread).unwrap();
    assert_eq!(info.size(), 2 * default_stack_size());
    assert_eq!(info.guard_size, 4 * page);
    assert_eq!(info.bottom - info.guard_size, info.allocation_base);
    f.runtime.join(thread).unwrap();
}

#[test]
fn main_thread_has_no_managed_stack() {
    let f = Fixture::new();
    let main = f.runtime.current().unwrap();
    let info = f.runtime.stack(main).unwrap();
    assert_eq!(info.size(), 0);
    assert_eq!(info.guard_size, 0);
    assert!(!info.custom);
    assert!(f.memory.is_reservation_base(main.to_raw() as usize));
}
