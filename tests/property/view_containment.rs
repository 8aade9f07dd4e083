//! Property tests for `ByteView` narrowing.
//!
//! A sub-view must always stay inside its parent, whatever offset and length
//! an untrusted header claims.

use proptest::prelude::*;

use scan_dispatch::ByteView;

proptest! {
    #[test]
    fn sub_view_stays_inside_parent(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
        offset in 0usize..1024,
        len in 0usize..1024,
    ) {
        let parent = ByteView::from_vec(bytes.clone());
        match parent.sub_view(offset, len) {
            None => prop_assert!(offset >= bytes.len()),
            Some(sub) => {
                prop_assert!(offset < bytes.len());
                prop_assert!(sub.len() >= 1);
                prop_assert!(offset + sub.len() <= bytes.len());
                if len != 0 {
                    prop_assert!(sub.len() <= len);
                }
                prop_assert_eq!(sub.as_slice(), &bytes[offset..offset + sub.len()]);
                prop_assert_eq!(sub.origin_offset(), offset as u64);
            }
        }
    }

    #[test]
    fn nested_sub_views_compose(
        bytes in prop::collection::vec(any::<u8>(), 1..256),
        a in 0usize..256,
        b in 0usize..256,
    ) {
        let parent = ByteView::from_vec(bytes.clone());
        if let Some(outer) = parent.sub_view(a, 0) {
            if let Some(inner) = outer.sub_view(b, 0) {
                prop_assert_eq!(inner.origin_offset(), (a + b) as u64);
                prop_assert_eq!(inner.as_slice(), &bytes[a + b..]);
            } else {
                prop_assert!(b >= outer.len());
            }
        }
    }

    #[test]
    fn need_is_all_or_nothing(
        bytes in prop::collection::vec(any::<u8>(), 0..128),
        offset in 0usize..160,
        len in 0usize..160,
    ) {
        let view = ByteView::from_vec(bytes.clone());
        let got = view.need(offset, len);
        if offset + len <= bytes.len() {
            prop_assert_eq!(got, Some(&bytes[offset..offset + len]));
        } else {
            prop_assert!(got.is_none());
        }
    }
}
