//! Intrusive doubly-linked list with head and tail sentinels.
//!
//! Threads and locks embed [`ListElem`] nodes directly, so membership costs
//! no allocation and removal is O(1) given the element. A single element
//! type can sit in different lists over its lifetime (a thread's queue node
//! moves between the ready queue and semaphore waiter lists), which is why
//! the operations work on raw element pointers rather than owned nodes.
//!
//! The embedding struct is recovered from a node with [`container_of!`],
//! which requires the struct to be `#[repr(C)]`.
//!
//! Lists are kept sorted by inserting with [`List::insert_ordered`]; when a
//! key changes while the element is linked, [`reorder`] repositions it in
//! place instead of rebuilding the list.

use core::ptr;

/// Recover a pointer to the struct embedding a [`ListElem`].
///
/// `$elem` must point at the `$field` node of a live `$ty`.
#[macro_export]
macro_rules! container_of {
    ($elem:expr, $ty:ty, $field:ident) => {
        $elem
            .cast::<u8>()
            .sub(core::mem::offset_of!($ty, $field))
            .cast::<$ty>()
    };
}

/// A list node, embedded in the struct that is being linked.
#[repr(C)]
#[derive(Debug)]
pub struct ListElem {
    pub(crate) prev: *mut ListElem,
    pub(crate) next: *mut ListElem,
}

impl ListElem {
    /// A new, unlinked node.
    pub const fn new() -> ListElem {
        ListElem {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

impl Default for ListElem {
    fn default() -> Self {
        Self::new()
    }
}

/// Comparator contract: `less(a, b)` returns true if `a` must appear
/// before `b` in a sorted list.
///
/// The head sentinel has no predecessor, the tail sentinel no successor;
/// interior elements have both.
#[inline]
fn is_head(e: *const ListElem) -> bool {
    !e.is_null() && unsafe { (*e).prev.is_null() && !(*e).next.is_null() }
}

#[inline]
fn is_interior(e: *const ListElem) -> bool {
    !e.is_null() && unsafe { !(*e).prev.is_null() && !(*e).next.is_null() }
}

#[inline]
fn is_tail(e: *const ListElem) -> bool {
    !e.is_null() && unsafe { !(*e).prev.is_null() && (*e).next.is_null() }
}

/// Insert `elem` just before `before`, which must be an interior element
/// or the tail sentinel of an initialized list.
///
/// # Safety
///
/// Both pointers must be valid; `elem` must not currently be linked.
pub unsafe fn insert(before: *mut ListElem, elem: *mut ListElem) {
    unsafe {
        debug_assert!(is_interior(before) || is_tail(before));
        (*elem).prev = (*before).prev;
        (*elem).next = before;
        (*(*before).prev).next = elem;
        (*before).prev = elem;
    }
}

/// Unlink `elem` from its list and return the element that followed it.
///
/// The element's own link fields are left dangling; relink before reuse.
///
/// # Safety
///
/// `elem` must be an interior element of an initialized list.
pub unsafe fn remove(elem: *mut ListElem) -> *mut ListElem {
    unsafe {
        debug_assert!(is_interior(elem));
        let next = (*elem).next;
        (*(*elem).prev).next = next;
        (*next).prev = (*elem).prev;
        next
    }
}

/// Reposition `elem` within its sorted list after its key has changed.
///
/// Compares against the immediate predecessor to pick a direction, unlinks
/// the element, walks to the first position that restores the sort order,
/// and relinks there. O(n); defined only for interior elements.
///
/// # Safety
///
/// `elem` must be an interior element of a list sorted according to `less`
/// everywhere except possibly at `elem` itself.
pub unsafe fn reorder<F>(elem: *mut ListElem, less: F)
where
    F: Fn(*const ListElem, *const ListElem) -> bool,
{
    unsafe {
        assert!(!elem.is_null());
        assert!(is_interior(elem));

        let mut e = (*elem).prev;
        let mut backward = true;
        if is_head(e) || !less(elem, e) {
            e = (*elem).next;
            backward = false;
            if is_tail(e) {
                return;
            }
        }
        remove(elem);
        if backward {
            while less(elem, e) && !is_head(e) {
                e = (*e).prev;
            }
            e = (*e).next;
        } else {
            while less(e, elem) && !is_tail(e) {
                e = (*e).next;
            }
        }
        insert(e, elem);
    }
}

/// An intrusive list. The sentinels live inside the struct, so a list must
/// be initialized in its final memory location with [`List::init`] before
/// use and never moved afterwards.
#[repr(C)]
pub struct List {
    head: ListElem,
    tail: ListElem,
}

impl List {
    /// A new, uninitialized list. Call [`List::init`] before use.
    pub const fn new() -> List {
        List {
            head: ListElem::new(),
            tail: ListElem::new(),
        }
    }

    /// Link the sentinels, emptying the list.
    pub fn init(&mut self) {
        self.head.prev = ptr::null_mut();
        self.head.next = &mut self.tail;
        self.tail.prev = &mut self.head;
        self.tail.next = ptr::null_mut();
    }

    /// First element, or [`List::end`] if the list is empty.
    pub fn begin(&self) -> *mut ListElem {
        debug_assert!(!self.head.next.is_null(), "list not initialized");
        self.head.next
    }

    /// One past the last element (the tail sentinel).
    pub fn end(&self) -> *mut ListElem {
        &self.tail as *const ListElem as *mut ListElem
    }

    pub fn is_empty(&self) -> bool {
        self.begin() == self.end()
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut e = self.begin();
        while e != self.end() {
            n += 1;
            e = unsafe { (*e).next };
        }
        n
    }

    /// First element. The list must not be empty.
    pub fn front(&self) -> *mut ListElem {
        assert!(!self.is_empty());
        self.head.next
    }

    /// Last element. The list must not be empty.
    pub fn back(&self) -> *mut ListElem {
        assert!(!self.is_empty());
        self.tail.prev
    }

    /// Append `elem`.
    ///
    /// # Safety
    ///
    /// `elem` must be valid and not currently linked.
    pub unsafe fn push_back(&mut self, elem: *mut ListElem) {
        unsafe { insert(self.end(), elem) }
    }

    /// Prepend `elem`.
    ///
    /// # Safety
    ///
    /// `elem` must be valid and not currently linked.
    pub unsafe fn push_front(&mut self, elem: *mut ListElem) {
        unsafe { insert(self.begin(), elem) }
    }

    /// Remove and return the first element. The list must not be empty.
    ///
    /// # Safety
    ///
    /// The list must be initialized.
    pub unsafe fn pop_front(&mut self) -> *mut ListElem {
        let front = self.front();
        unsafe { remove(front) };
        front
    }

    /// Insert `elem` before the first element that should follow it, keeping
    /// the list sorted. Insertion is stable: among equal keys the newcomer
    /// lands last.
    ///
    /// # Safety
    ///
    /// `elem` must be valid and unlinked; the list must already be sorted
    /// according to `less`.
    pub unsafe fn insert_ordered<F>(&mut self, elem: *mut ListElem, less: F)
    where
        F: Fn(*const ListElem, *const ListElem) -> bool,
    {
        unsafe {
            let mut e = self.begin();
            while e != self.end() && !less(elem, e) {
                e = (*e).next;
            }
            insert(e, elem);
        }
    }

    /// The least element according to `less`, or [`List::end`] if the list
    /// is empty. Ties resolve to the earliest such element.
    pub fn min<F>(&self, less: F) -> *mut ListElem
    where
        F: Fn(*const ListElem, *const ListElem) -> bool,
    {
        let mut min = self.begin();
        if min != self.end() {
            let mut e = unsafe { (*min).next };
            while e != self.end() {
                if less(e, min) {
                    min = e;
                }
                e = unsafe { (*e).next };
            }
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[repr(C)]
    struct Item {
        elem: ListElem,
        key: i32,
    }

    impl Item {
        fn new(key: i32) -> Box<Item> {
            Box::new(Item {
                elem: ListElem::new(),
                key,
            })
        }
    }

    fn item_less(a: *const ListElem, b: *const ListElem) -> bool {
        // Descending by key, like the ready queue.
        unsafe { (*container_of!(a, Item, elem)).key > (*container_of!(b, Item, elem)).key }
    }

    fn keys(list: &List) -> Vec<i32> {
        let mut out = Vec::new();
        let mut e = list.begin();
        while e != list.end() {
            unsafe {
                out.push((*container_of!(e, Item, elem)).key);
                e = (*e).next;
            }
        }
        out
    }

    fn new_list() -> Box<List> {
        let mut list = Box::new(List::new());
        list.init();
        list
    }

    #[test]
    fn push_pop_front_back() {
        let mut list = new_list();
        let mut a = Item::new(1);
        let mut b = Item::new(2);
        let mut c = Item::new(3);
        unsafe {
            list.push_back(&mut a.elem);
            list.push_back(&mut b.elem);
            list.push_front(&mut c.elem);
        }
        assert_eq!(keys(&list), [3, 1, 2]);
        assert_eq!(list.len(), 3);
        assert!(!list.is_empty());

        unsafe {
            let e = list.pop_front();
            assert_eq!((*container_of!(e, Item, elem)).key, 3);
        }
        assert_eq!(keys(&list), [1, 2]);
        assert_eq!(list.front(), &mut a.elem as *mut ListElem);
        assert_eq!(list.back(), &mut b.elem as *mut ListElem);
    }

    #[test]
    fn remove_is_position_independent() {
        let mut list = new_list();
        let mut items: Vec<Box<Item>> = (0..5).map(Item::new).collect();
        for item in items.iter_mut() {
            unsafe { list.push_back(&mut item.elem) };
        }
        unsafe {
            remove(&mut items[2].elem);
        }
        assert_eq!(keys(&list), [0, 1, 3, 4]);
        unsafe {
            remove(&mut items[0].elem);
            remove(&mut items[4].elem);
        }
        assert_eq!(keys(&list), [1, 3]);
    }

    #[test]
    fn insert_ordered_sorts_descending() {
        let mut list = new_list();
        let mut items: Vec<Box<Item>> = [20, 40, 30, 10, 35]
            .iter()
            .map(|&k| Item::new(k))
            .collect();
        for item in items.iter_mut() {
            unsafe { list.insert_ordered(&mut item.elem, item_less) };
        }
        assert_eq!(keys(&list), [40, 35, 30, 20, 10]);
    }

    #[test]
    fn insert_ordered_is_stable_within_ties() {
        let mut list = new_list();
        let mut a = Item::new(20);
        let mut b = Item::new(20);
        let mut c = Item::new(20);
        let mut hi = Item::new(30);
        unsafe {
            list.insert_ordered(&mut a.elem, item_less);
            list.insert_ordered(&mut b.elem, item_less);
            list.insert_ordered(&mut hi.elem, item_less);
            list.insert_ordered(&mut c.elem, item_less);
        }
        // Equal keys keep arrival order behind the higher key.
        assert_eq!(keys(&list), [30, 20, 20, 20]);
        unsafe {
            assert_eq!(list.begin(), &mut hi.elem as *mut ListElem);
            assert_eq!((*(&mut hi.elem as *mut ListElem)).next, &mut a.elem as *mut ListElem);
        }
    }

    #[test]
    fn min_finds_greatest_key_under_descending_less() {
        let mut list = new_list();
        let mut items: Vec<Box<Item>> = [5, 9, 1, 9, 3].iter().map(|&k| Item::new(k)).collect();
        for item in items.iter_mut() {
            unsafe { list.push_back(&mut item.elem) };
        }
        let m = list.min(item_less);
        unsafe {
            assert_eq!((*container_of!(m, Item, elem)).key, 9);
            // Ties resolve to the earliest element.
            assert_eq!(m, &mut items[1].elem as *mut ListElem);
        }
    }

    #[test]
    fn min_of_empty_list_is_end() {
        let list = new_list();
        assert_eq!(list.min(item_less), list.end());
    }

    #[test]
    fn reorder_moves_toward_front() {
        let mut list = new_list();
        let mut items: Vec<Box<Item>> = [50, 40, 30, 20].iter().map(|&k| Item::new(k)).collect();
        for item in items.iter_mut() {
            unsafe { list.push_back(&mut item.elem) };
        }
        // Raise the key of the third element past the first.
        items[2].key = 60;
        unsafe { reorder(&mut items[2].elem, item_less) };
        assert_eq!(keys(&list), [60, 50, 40, 20]);
    }

    #[test]
    fn reorder_moves_toward_back() {
        let mut list = new_list();
        let mut items: Vec<Box<Item>> = [50, 40, 30, 20].iter().map(|&k| Item::new(k)).collect();
        for item in items.iter_mut() {
            unsafe { list.push_back(&mut item.elem) };
        }
        items[0].key = 25;
        unsafe { reorder(&mut items[0].elem, item_less) };
        assert_eq!(keys(&list), [40, 30, 25, 20]);
    }

    #[test]
    fn reorder_leaves_correct_position_alone() {
        let mut list = new_list();
        let mut items: Vec<Box<Item>> = [50, 40, 30].iter().map(|&k| Item::new(k)).collect();
        for item in items.iter_mut() {
            unsafe { list.push_back(&mut item.elem) };
        }
        items[1].key = 45; // still between 50 and 30
        unsafe { reorder(&mut items[1].elem, item_less) };
        assert_eq!(keys(&list), [50, 45, 30]);
    }

    #[test]
    fn reorder_is_safe_at_both_ends() {
        let mut list = new_list();
        let mut a = Item::new(50);
        let mut b = Item::new(40);
        unsafe {
            list.push_back(&mut a.elem);
            list.push_back(&mut b.elem);
        }
        // Front element sinks to the back.
        a.key = 10;
        unsafe { reorder(&mut a.elem, item_less) };
        assert_eq!(keys(&list), [40, 10]);
        // Back element rises to the front.
        a.key = 90;
        unsafe { reorder(&mut a.elem, item_less) };
        assert_eq!(keys(&list), [90, 40]);
    }

    #[test]
    fn reorder_singleton_is_a_no_op() {
        let mut list = new_list();
        let mut a = Item::new(50);
        unsafe { list.push_back(&mut a.elem) };
        a.key = 1;
        unsafe { reorder(&mut a.elem, item_less) };
        assert_eq!(keys(&list), [1]);
    }
}
