use itertools::Itertools;
use ldap3_proto::{LdapFilter, LdapPartialAttribute, LdapResultCode, LdapSearchResultEntry, proto::LdapSubstringFilter};
use regex::Regex;

use crate::proto;

const FILTER_MAX_DEPTH: usize = 5;
const FILTER_MAX_ELEMENTS: usize = 10;

/// An attribute of an entry, remembering the casing it was set with.
#[derive(Debug, Clone)]
struct Attribute {
    name: String,
    values: Vec<String>,
}

/// A data class representing an entry in our directory. Attributes keep the order they were set in.
#[derive(Debug, Clone)]
pub struct LdapEntry {
    pub dn: String,
    attributes: Vec<Attribute>,
}

impl LdapEntry {
    pub fn new(dn: String) -> Self {
        LdapEntry { dn, attributes: Vec::new() }
    }

    /// Sets an attribute for this entry. As LDAP is case-insensitive regarding attribute names,
    /// an attribute differing only in casing is replaced in place.
    pub fn set_attribute(&mut self, name: &str, values: Vec<String>) {
        let attribute = Attribute {
            name: name.to_string(),
            values,
        };
        match self.attributes.iter_mut().find(|attr| attr.name.eq_ignore_ascii_case(name)) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    /// Gets the values of an attribute, ignoring the casing of its name.
    pub fn get_attribute(&self, name: &str) -> Option<&Vec<String>> {
        self.attributes
            .iter()
            .find(|attr| attr.name.eq_ignore_ascii_case(name))
            .map(|attr| &attr.values)
    }

    /// Get a key-value pair for an attribute. Ensures to return the key casing specified by the client.
    fn get_key_value<'a>(&'a self, attribute_name: &'a String) -> Option<(&'a String, &'a Vec<String>)> {
        Some((attribute_name, self.get_attribute(attribute_name)?))
    }

    /// The client appears to have searched for this entry. Convert this entry into the data
    /// format that will be sent over the wire, only including the attributes that the client requested.
    /// Note that this method will NOT check whether this entry matches the filter specified by the client.
    pub fn new_search_result(&self, requested_attributes: &[String]) -> LdapSearchResultEntry {
        let all_requested = requested_attributes.is_empty() ||
            // We don't have any operational attributes, so this is equivalent
            requested_attributes.iter().any(|attr| attr == "*" || attr == "+");
        let target_attributes: Vec<(&String, &Vec<String>)> = if all_requested {
            self.attributes.iter().map(|attr| (&attr.name, &attr.values)).collect()
        } else {
            requested_attributes.iter().unique().filter_map(|attr| self.get_key_value(attr)).collect()
        };

        LdapSearchResultEntry {
            dn: self.dn.clone(),
            attributes: target_attributes
                .into_iter()
                .map(|(key, value)| LdapPartialAttribute {
                    atype: key.to_string(),
                    vals: value.iter().map(|entry| entry.as_bytes().to_vec()).collect(),
                })
                .collect(),
        }
    }

    /// Check whether this entry matches the filter the client specified in its search.
    /// Enforces some limits on how complex that filter is allowed to be.
    pub fn matches_filter(&self, f: &LdapFilter) -> Result<bool, proto::LdapError> {
        let mut max_elements = FILTER_MAX_ELEMENTS;
        self._matches_filter(f, FILTER_MAX_DEPTH, &mut max_elements)
    }

    fn _matches_filter(&self, f: &LdapFilter, depth: usize, elems: &mut usize) -> Result<bool, proto::LdapError> {
        let mut new_depth = depth;
        consume_resource(&mut new_depth, 1)?;
        match f {
            LdapFilter::And(l) => {
                consume_resource(elems, l.len())?;

                for sub_filter in l.iter() {
                    if !self._matches_filter(sub_filter, new_depth, elems)? {
                        return Ok(false);
                    }
                }

                Ok(true)
            }
            LdapFilter::Or(l) => {
                consume_resource(elems, l.len())?;

                for sub_filter in l.iter() {
                    if self._matches_filter(sub_filter, new_depth, elems)? {
                        return Ok(true);
                    }
                }

                Ok(false)
            }
            LdapFilter::Not(sub_filter) => Ok(!self._matches_filter(sub_filter, new_depth, elems)?),
            LdapFilter::Equality(a, v) => {
                // If the attribute does not even exist, we have no match.
                Ok(self.get_attribute(a).is_some_and(|values| values.iter().any(|val| val == v)))
            }
            LdapFilter::Present(a) => Ok(self.get_attribute(a).is_some()),
            LdapFilter::Substring(a, substrings) => match self.get_attribute(a) {
                Some(values) => {
                    let substr_filter = substring_regex(substrings)?;
                    Ok(values.iter().any(|value| substr_filter.is_match(value)))
                }
                None => Ok(false),
            },
            _ => {
                tracing::warn!(filter = ?f, "Unsupported filter operation");
                Err(proto::LdapError(LdapResultCode::UnwillingToPerform, "Operation not implemented".to_string()))
            }
        }
    }
}

/// Translate a substring assertion into an anchored regular expression over the fully escaped parts.
fn substring_regex(LdapSubstringFilter { initial, any, final_ }: &LdapSubstringFilter) -> Result<Regex, proto::LdapError> {
    let mut regex = "^".to_string();
    if let Some(search) = initial {
        regex += &regex::escape(search);
    }
    regex += ".*";
    for search in any {
        regex += &regex::escape(search);
        regex += ".*";
    }
    if let Some(search) = final_ {
        regex += &regex::escape(search);
    }
    regex += "$";
    Regex::new(regex.as_str()).map_err(|e| proto::LdapError(LdapResultCode::Other, format!("Invalid substring filter: {e}")))
}

fn consume_resource(resource: &mut usize, consumption_amount: usize) -> Result<(), proto::LdapError> {
    *resource = resource
        .checked_sub(consumption_amount)
        .ok_or(proto::LdapError(LdapResultCode::UnwillingToPerform, "Filter too expensive".to_string()))?;
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use rstest::*;

    use super::*;

    mod when_creating_search_result {
        use super::*;

        const DUMMY_DN: &str = "identifier=dummy,ou=identities";

        #[fixture]
        fn entry_with_some_attributes() -> LdapEntry {
            let mut entry = LdapEntry::new(DUMMY_DN.to_string());
            entry.set_attribute("objectClass", vec!["default".to_string()]);
            entry.set_attribute("abc", vec!["abc".to_string()]);
            entry.set_attribute("def", vec!["def".to_string()]);
            entry.set_attribute("ghi", vec!["ghi".to_string()]);
            entry
        }

        #[rstest]
        fn then_return_dn(entry_with_some_attributes: LdapEntry) {
            // when & then
            assert_eq!(DUMMY_DN, entry_with_some_attributes.new_search_result(&[]).dn)
        }

        #[rstest]
        fn then_return_all_attributes_when_no_filter(entry_with_some_attributes: LdapEntry) {
            // when & then
            assert_eq!(1 + 3, entry_with_some_attributes.new_search_result(&[]).attributes.len())
        }

        #[rstest]
        fn then_return_all_attributes_in_insertion_order(entry_with_some_attributes: LdapEntry) {
            // when
            let result = entry_with_some_attributes.new_search_result(&[]);

            // then
            let names: Vec<&str> = result.attributes.iter().map(|attr| attr.atype.as_str()).collect();
            assert_eq!(names, vec!["objectClass", "abc", "def", "ghi"]);
        }

        #[rstest]
        fn then_replace_attribute_differing_in_casing_in_place(mut entry_with_some_attributes: LdapEntry) {
            // given
            entry_with_some_attributes.set_attribute("ABC", vec!["replaced".to_string()]);

            // when
            let result = entry_with_some_attributes.new_search_result(&[]);

            // then
            assert_eq!(result.attributes.len(), 4);
            assert_eq!(result.attributes[1].atype, "ABC");
            assert_eq!(result.attributes[1].vals, vec![b"replaced".to_vec()]);
        }

        #[rstest]
        fn then_return_all_attributes_with_original_casing(entry_with_some_attributes: LdapEntry) {
            // when
            let result = entry_with_some_attributes.new_search_result(&["*".to_string()]);

            // then
            assert!(result.attributes.iter().any(|attr| attr.atype == "objectClass"));
        }

        #[rstest]
        fn then_return_all_attributes_on_special_selectors(entry_with_some_attributes: LdapEntry) {
            // when & then
            assert_eq!(1 + 3, entry_with_some_attributes.new_search_result(&["*".to_string()]).attributes.len());
            assert_eq!(1 + 3, entry_with_some_attributes.new_search_result(&["+".to_string()]).attributes.len());
        }

        #[rstest]
        fn then_return_only_requested_attributes(entry_with_some_attributes: LdapEntry) {
            // when
            let result = entry_with_some_attributes.new_search_result(&["abc".to_string(), "ghi".to_string()]);

            // then
            assert_eq!(2, result.attributes.len());
            assert_eq!("abc", result.attributes.first().unwrap().atype);
            assert_eq!("ghi", result.attributes.get(1).unwrap().atype);
        }

        #[rstest]
        fn then_do_not_return_attribute_twice(entry_with_some_attributes: LdapEntry) {
            // when
            let result = entry_with_some_attributes.new_search_result(&["abc".to_string(), "abc".to_string()]);

            // then
            assert_eq!(1, result.attributes.len());
        }

        #[rstest]
        fn then_ignore_non_existent_attribute(entry_with_some_attributes: LdapEntry) {
            // when
            let result = entry_with_some_attributes.new_search_result(&["non-existent-attribute".to_string()]);

            // then
            assert_eq!(0, result.attributes.len());
        }

        #[rstest]
        fn then_return_attribute_cased_as_requested(entry_with_some_attributes: LdapEntry) {
            // when
            let result = entry_with_some_attributes.new_search_result(&["aBc".to_string(), "OBJECTCLASS".to_string()]);

            // then
            assert_eq!(2, result.attributes.len());
            assert_eq!("aBc", result.attributes.first().unwrap().atype);
            assert_eq!("OBJECTCLASS", result.attributes.get(1).unwrap().atype);
        }
    }

    mod when_filtering {
        use ldap3_proto::proto::LdapMatchingRuleAssertion;

        use super::*;

        #[fixture]
        fn dummy_entry() -> LdapEntry {
            let mut entry = LdapEntry::new("identifier=dummy,ou=identities".to_string());
            entry.set_attribute("objectClass", vec!["default".to_string()]);
            entry
        }

        fn matching_filter() -> LdapFilter {
            LdapFilter::Present("objectclass".to_string())
        }

        fn non_matching_filter() -> LdapFilter {
            LdapFilter::Not(Box::new(matching_filter()))
        }

        #[rstest]
        fn then_and_filter_works_correctly(dummy_entry: LdapEntry) {
            // when & then
            assert!(
                dummy_entry
                    .matches_filter(&LdapFilter::And(vec![matching_filter(), matching_filter(), matching_filter()]))
                    .unwrap()
            );
            assert!(
                !dummy_entry
                    .matches_filter(&LdapFilter::And(vec![matching_filter(), non_matching_filter(), matching_filter()]))
                    .unwrap()
            );
        }

        #[rstest]
        fn then_or_filter_works_correctly(dummy_entry: LdapEntry) {
            // when & then
            assert!(
                !dummy_entry
                    .matches_filter(&LdapFilter::Or(vec![non_matching_filter(), non_matching_filter(), non_matching_filter()]))
                    .unwrap()
            );
            assert!(
                dummy_entry
                    .matches_filter(&LdapFilter::Or(vec![non_matching_filter(), non_matching_filter(), matching_filter()]))
                    .unwrap()
            );
        }

        #[rstest]
        fn then_not_filter_works_correctly(dummy_entry: LdapEntry) {
            // when & then
            assert!(dummy_entry.matches_filter(&LdapFilter::Not(Box::new(non_matching_filter()))).unwrap());
            assert!(!dummy_entry.matches_filter(&LdapFilter::Not(Box::new(matching_filter()))).unwrap());
        }

        #[rstest]
        #[case("*", true)]
        #[case("very*", true)]
        #[case("*long*", true)]
        #[case("long*", false)]
        #[case("*long", false)]
        #[case("*value", true)]
        #[case("v*long*l*e", true)]
        fn then_substring_filter_works_correctly(mut dummy_entry: LdapEntry, #[case] filter_string: String, #[case] should_match: bool) {
            // given
            dummy_entry.set_attribute("attr", vec!["very_long_value".to_string()]);

            // when & then
            assert_eq!(
                should_match,
                dummy_entry
                    .matches_filter(&LdapFilter::Substring("attr".to_string(), LdapSubstringFilter::from(filter_string)))
                    .unwrap()
            )
        }

        #[rstest]
        fn then_present_filter_works_correctly(mut dummy_entry: LdapEntry) {
            // given
            dummy_entry.set_attribute("attr", vec!["value".to_string()]);

            // when & then
            assert!(dummy_entry.matches_filter(&LdapFilter::Present("attr".to_string())).unwrap());
            assert!(!dummy_entry.matches_filter(&LdapFilter::Present("other_attr".to_string())).unwrap());
        }

        #[rstest]
        fn then_equality_filter_works_correctly(mut dummy_entry: LdapEntry) {
            // given
            dummy_entry.set_attribute("emails", vec!["a@example.org".to_string(), "b@example.org".to_string()]);

            // when & then
            assert!(
                dummy_entry
                    .matches_filter(&LdapFilter::Equality("emails".to_string(), "b@example.org".to_string()))
                    .unwrap()
            );
            assert!(
                !dummy_entry
                    .matches_filter(&LdapFilter::Equality("emails".to_string(), "c@example.org".to_string()))
                    .unwrap()
            );
            assert!(
                !dummy_entry
                    .matches_filter(&LdapFilter::Equality("other_attr".to_string(), "a@example.org".to_string()))
                    .unwrap()
            );
        }

        #[rstest]
        fn then_match_attribute_names_case_insensitive(mut dummy_entry: LdapEntry) {
            // given
            dummy_entry.set_attribute("attribute", vec!["value".to_string()]);

            let filter = LdapFilter::Present("AttRIbUTe".to_string());

            // when & then
            assert!(dummy_entry.matches_filter(&filter).unwrap())
        }

        #[rstest]
        #[case::le(LdapFilter::LessOrEqual("".to_string(), "".to_string()))]
        #[case::ge(LdapFilter::GreaterOrEqual("".to_string(), "".to_string()))]
        #[case::approx(LdapFilter::Approx("".to_string(), "".to_string()))]
        #[case::extensible(LdapFilter::Extensible(LdapMatchingRuleAssertion{..Default::default()}))]
        fn then_reject_unsupported_filter(dummy_entry: LdapEntry, #[case] filter: LdapFilter) {
            // when
            let result = dummy_entry.matches_filter(&filter);

            // then
            assert!(matches!(result, Err(proto::LdapError(LdapResultCode::UnwillingToPerform, _))));
        }

        #[rstest]
        fn then_forbid_too_many_filter_elements(dummy_entry: LdapEntry) {
            // given
            let sub_filters: Vec<LdapFilter> = (0..FILTER_MAX_ELEMENTS + 1).map(|_| matching_filter()).collect();

            // when & then
            assert!(dummy_entry.matches_filter(&LdapFilter::And(sub_filters.clone())).is_err());
            assert!(dummy_entry.matches_filter(&LdapFilter::Or(sub_filters)).is_err());
        }

        #[rstest]
        #[case::not(|f| LdapFilter::Not(Box::new(f)))]
        #[case::and(|f| LdapFilter::And(vec![f]))]
        #[case::or(|f| LdapFilter::Or(vec![f]))]
        fn then_forbid_too_deep_nesting<F>(dummy_entry: LdapEntry, #[case] mk_filter: F)
        where
            F: Fn(LdapFilter) -> LdapFilter,
        {
            // given
            let mut filter = matching_filter();
            for _ in 0..FILTER_MAX_DEPTH + 1 {
                filter = mk_filter(filter);
            }

            // when & then
            assert!(dummy_entry.matches_filter(&filter).is_err())
        }
    }
}
