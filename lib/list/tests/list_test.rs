// Copyright 2025 The Kestrel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License. You may obtain a copy of
// the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
// License for the specific language governing permissions and limitations under
// the License.

use core::ptr::NonNull;

use list::{Link, UnsafeList};

struct Node {
    link: Link,
    value: u32,
}

impl Node {
    fn new(value: u32) -> Self {
        Self {
            link: Link::new(),
            value,
        }
    }
}

list::define_adapter!(NodeAdapter => Node.link);

type NodeList = UnsafeList<Node, NodeAdapter>;

fn collect(list: &NodeList) -> Vec<u32> {
    let mut values = Vec::new();
    unsafe {
        list.for_each(|node| -> Result<(), ()> {
            values.push(node.value);
            Ok(())
        })
        .unwrap();
    }
    values
}

#[test]
fn new_list_is_empty() {
    let list = NodeList::new();
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
    assert!(unsafe { list.peek_head() }.is_none());
}

#[test]
fn push_front_and_back_maintain_order() {
    let mut a = Node::new(1);
    let mut b = Node::new(2);
    let mut c = Node::new(3);
    let mut list = NodeList::new();

    unsafe {
        list.push_back_unchecked(&mut b);
        list.push_front_unchecked(&mut a);
        list.push_back_unchecked(&mut c);
    }

    assert_eq!(collect(&list), vec![1, 2, 3]);
    assert_eq!(list.len(), 3);
}

#[test]
fn pop_head_returns_elements_in_order() {
    let mut a = Node::new(1);
    let mut b = Node::new(2);
    let mut list = NodeList::new();

    unsafe {
        list.push_back_unchecked(&mut a);
        list.push_back_unchecked(&mut b);

        assert_eq!(list.pop_head().unwrap().as_ref().value, 1);
        assert_eq!(list.pop_head().unwrap().as_ref().value, 2);
        assert!(list.pop_head().is_none());
    }

    assert!(list.is_empty());
    assert!(a.link.is_unlinked());
    assert!(b.link.is_unlinked());
}

#[test]
fn unlink_element_from_middle() {
    let mut a = Node::new(1);
    let mut b = Node::new(2);
    let mut c = Node::new(3);
    let mut list = NodeList::new();

    unsafe {
        list.push_back_unchecked(&mut a);
        list.push_back_unchecked(&mut b);
        list.push_back_unchecked(&mut c);

        let b_ptr = NonNull::from(&mut b);
        assert!(list.unlink_element(b_ptr).is_some());
        // A second unlink is a no-op.
        assert!(list.unlink_element(b_ptr).is_none());
    }

    assert_eq!(collect(&list), vec![1, 3]);
    assert_eq!(list.len(), 2);
    assert!(b.link.is_unlinked());
}

#[test]
fn link_state_tracks_membership() {
    let mut a = Node::new(1);
    let mut list = NodeList::new();

    assert!(a.link.is_unlinked());
    unsafe {
        list.push_back_unchecked(&mut a);
        assert!(NodeList::is_element_linked(NonNull::from(&mut a)));
        list.pop_head();
        assert!(!NodeList::is_element_linked(NonNull::from(&mut a)));
    }
}

#[test]
fn sorted_insert_orders_by_predicate() {
    let mut a = Node::new(30);
    let mut b = Node::new(10);
    let mut c = Node::new(20);
    let mut list = NodeList::new();

    unsafe {
        list.insert_sorted_by_unchecked(&mut a, |new, cur| new.value < cur.value);
        list.insert_sorted_by_unchecked(&mut b, |new, cur| new.value < cur.value);
        list.insert_sorted_by_unchecked(&mut c, |new, cur| new.value < cur.value);
    }

    assert_eq!(collect(&list), vec![10, 20, 30]);
}

#[test]
fn sorted_insert_keeps_fifo_order_within_equal_keys() {
    // Key is value / 10; the low digit records insertion order.
    let mut nodes = [
        Node::new(21),
        Node::new(11),
        Node::new(22),
        Node::new(12),
        Node::new(23),
    ];
    let mut list = NodeList::new();

    unsafe {
        for node in nodes.iter_mut() {
            list.insert_sorted_by_unchecked(node, |new, cur| new.value / 10 < cur.value / 10);
        }
    }

    assert_eq!(collect(&list), vec![11, 12, 21, 22, 23]);
}

#[test]
fn filter_unlinks_rejected_elements() {
    let mut a = Node::new(1);
    let mut b = Node::new(2);
    let mut c = Node::new(3);
    let mut d = Node::new(4);
    let mut list = NodeList::new();

    unsafe {
        list.push_back_unchecked(&mut a);
        list.push_back_unchecked(&mut b);
        list.push_back_unchecked(&mut c);
        list.push_back_unchecked(&mut d);

        list.filter(|node| node.value % 2 == 1);
    }

    assert_eq!(collect(&list), vec![1, 3]);
    assert_eq!(list.len(), 2);
    assert!(b.link.is_unlinked());
    assert!(d.link.is_unlinked());
}
