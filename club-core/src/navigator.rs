//! Wrap-around cursor over an album's photos.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavigatorError {
    /// Opening or stepping through an album with no photos.
    #[error("Photo navigator has no items")]
    Empty,
    #[error("Photo index {index} out of range for {len} items")]
    OutOfRange { index: usize, len: usize },
    #[error("No photo is open")]
    Closed,
}

/// What the gallery renders: the photos and which one is open, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigatorState {
    pub items: Vec<String>,
    pub cursor: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PhotoNavigator {
    items: Vec<String>,
    cursor: Option<usize>,
}

impl PhotoNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, items: Vec<String>, index: usize) -> Result<usize, NavigatorError> {
        if items.is_empty() {
            return Err(NavigatorError::Empty);
        }
        if index >= items.len() {
            return Err(NavigatorError::OutOfRange {
                index,
                len: items.len(),
            });
        }
        self.items = items;
        self.cursor = Some(index);
        Ok(index)
    }

    pub fn next(&mut self) -> Result<usize, NavigatorError> {
        let (cursor, len) = self.position()?;
        let next = (cursor + 1) % len;
        self.cursor = Some(next);
        Ok(next)
    }

    pub fn prev(&mut self) -> Result<usize, NavigatorError> {
        let (cursor, len) = self.position()?;
        let prev = (cursor + len - 1) % len;
        self.cursor = Some(prev);
        Ok(prev)
    }

    pub fn close(&mut self) {
        self.cursor = None;
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&str> {
        self.cursor.and_then(|i| self.items.get(i)).map(String::as_str)
    }

    pub fn state(&self) -> NavigatorState {
        NavigatorState {
            items: self.items.clone(),
            cursor: self.cursor,
        }
    }

    /// Swap in a newer photo list while a photo is open. Albums only grow,
    /// so the cursor stays on the same photo; if the list shrank anyway the
    /// cursor is clamped, and an empty list closes the navigator.
    pub fn replace_items(&mut self, items: Vec<String>) {
        self.cursor = match self.cursor {
            _ if items.is_empty() => None,
            Some(i) => Some(i.min(items.len() - 1)),
            None => None,
        };
        self.items = items;
    }

    fn position(&self) -> Result<(usize, usize), NavigatorError> {
        let cursor = self.cursor.ok_or(NavigatorError::Closed)?;
        match self.items.len() {
            0 => Err(NavigatorError::Empty),
            len => Ok((cursor, len)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four() -> Vec<String> {
        (0..4).map(|i| format!("https://blobs.test/{i}.jpg")).collect()
    }

    #[test]
    fn four_nexts_wrap_back_to_start() {
        let mut nav = PhotoNavigator::new();
        nav.open(four(), 0).unwrap();
        for expected in [1, 2, 3, 0] {
            assert_eq!(nav.next().unwrap(), expected);
        }
        assert_eq!(nav.cursor(), Some(0));
    }

    #[test]
    fn prev_from_first_goes_to_last() {
        let mut nav = PhotoNavigator::new();
        nav.open(four(), 0).unwrap();
        assert_eq!(nav.prev().unwrap(), 3);
        assert_eq!(nav.current(), Some("https://blobs.test/3.jpg"));
    }

    #[test]
    fn single_item_stays_put() {
        let mut nav = PhotoNavigator::new();
        nav.open(vec!["only".into()], 0).unwrap();
        assert_eq!(nav.next().unwrap(), 0);
        assert_eq!(nav.prev().unwrap(), 0);
    }

    #[test]
    fn empty_album_cannot_be_opened() {
        let mut nav = PhotoNavigator::new();
        assert_eq!(nav.open(vec![], 0), Err(NavigatorError::Empty));
        assert_eq!(nav.cursor(), None);
    }

    #[test]
    fn out_of_range_open_is_rejected() {
        let mut nav = PhotoNavigator::new();
        assert_eq!(
            nav.open(four(), 4),
            Err(NavigatorError::OutOfRange { index: 4, len: 4 })
        );
    }

    #[test]
    fn stepping_while_closed_fails() {
        let mut nav = PhotoNavigator::new();
        assert_eq!(nav.next(), Err(NavigatorError::Closed));
        nav.open(four(), 2).unwrap();
        nav.close();
        assert_eq!(nav.prev(), Err(NavigatorError::Closed));
        assert_eq!(nav.state(), NavigatorState { items: four(), cursor: None });
    }

    #[test]
    fn replacing_items_keeps_or_clamps_cursor() {
        let mut nav = PhotoNavigator::new();
        nav.open(four(), 3).unwrap();

        let mut grown = four();
        grown.push("new".into());
        nav.replace_items(grown);
        assert_eq!(nav.cursor(), Some(3));

        nav.replace_items(vec!["a".into(), "b".into()]);
        assert_eq!(nav.cursor(), Some(1));

        nav.replace_items(vec![]);
        assert_eq!(nav.cursor(), None);
    }
}
