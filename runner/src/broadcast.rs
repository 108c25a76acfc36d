use crate::arguments::ArgumentValue;
use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Parameters must share a length or be single values, lengths {0:?}")]
    MismatchedLengths(Vec<usize>),
}

/// Number of tuples a set of bound values expands into.
///
/// Scalars and single-element lists broadcast. Every other list has to share
/// one length. Without any such list the result is a single tuple.
pub fn tuple_count(values: &[ArgumentValue]) -> Result<usize, BroadcastError> {
    let lengths = values
        .iter()
        .map(ArgumentValue::broadcast_len)
        .filter(|length| *length != 1)
        .sorted()
        .dedup()
        .collect_vec();

    match lengths.as_slice() {
        [] => Ok(1),
        [length] => Ok(*length),
        _ => Err(BroadcastError::MismatchedLengths(lengths)),
    }
}

/// Expand bound values into positional tuples, one per unit of work
pub fn expand(values: &[ArgumentValue]) -> Result<Vec<Vec<ArgumentValue>>, BroadcastError> {
    let count = tuple_count(values)?;

    Ok((0..count)
        .map(|index| {
            values
                .iter()
                .map(|value| match value {
                    ArgumentValue::List(items) if items.len() == 1 => items[0].clone(),
                    ArgumentValue::List(items) => items[index].clone(),
                    scalar => scalar.clone(),
                })
                .collect_vec()
        })
        .collect_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(length: usize) -> ArgumentValue {
        ArgumentValue::List((0..length as i64).map(ArgumentValue::Integer).collect())
    }

    #[test]
    fn single_element_lists_broadcast() {
        let tuples = expand(&[list(1), list(1), list(5)]).unwrap();

        assert_eq!(tuples.len(), 5);
        assert_eq!(
            tuples[3],
            vec![
                ArgumentValue::Integer(0),
                ArgumentValue::Integer(0),
                ArgumentValue::Integer(3)
            ]
        );
    }

    #[test]
    fn distinct_lengths_never_truncate() {
        assert_eq!(
            expand(&[list(3), list(5)]),
            Err(BroadcastError::MismatchedLengths(vec![3, 5]))
        );
    }

    #[test]
    fn scalars_only_yield_one_tuple() {
        let tuples = expand(&[ArgumentValue::Integer(256), ArgumentValue::from("fast")]).unwrap();

        assert_eq!(
            tuples,
            vec![vec![ArgumentValue::Integer(256), ArgumentValue::from("fast")]]
        );
        assert_eq!(tuple_count(&[]), Ok(1));
    }

    #[test]
    fn scalar_repeats_alongside_list() {
        let tuples = expand(&[
            ArgumentValue::Integer(256),
            ArgumentValue::from(vec!["a.jpg", "b.jpg"]),
        ])
        .unwrap();

        assert_eq!(
            tuples,
            vec![
                vec![ArgumentValue::Integer(256), ArgumentValue::from("a.jpg")],
                vec![ArgumentValue::Integer(256), ArgumentValue::from("b.jpg")],
            ]
        );
    }

    #[test]
    fn empty_list_yields_no_tuples() {
        assert_eq!(tuple_count(&[ArgumentValue::Integer(1), list(0)]), Ok(0));
        assert!(expand(&[list(0)]).unwrap().is_empty());
    }
}
