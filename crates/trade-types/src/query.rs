//! Discovery queries over brokers and products

use crate::{Broker, Location, Product};
use serde::{Deserialize, Serialize};

/// Brokers in any of `locations`; an empty list matches every broker
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSearchQuery {
    pub locations: Vec<Location>,
}

impl BrokerSearchQuery {
    pub fn matches(&self, broker: &Broker) -> bool {
        self.locations.is_empty() || self.locations.contains(&broker.location)
    }
}

/// Product filter. Empty `data_type` and zero upper bounds are wildcards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductSearchQuery {
    pub data_type: String,
    pub min_cost: u64,
    pub max_cost: u64,
    pub min_frequency: u64,
    pub max_frequency: u64,
}

impl ProductSearchQuery {
    pub fn matches(&self, product: &Product) -> bool {
        if !self.data_type.is_empty() && product.data_type != self.data_type {
            return false;
        }
        if product.cost < self.min_cost || (self.max_cost != 0 && product.cost > self.max_cost) {
            return false;
        }
        if product.frequency < self.min_frequency
            || (self.max_frequency != 0 && product.frequency > self.max_frequency)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, ProductId};

    fn product(data_type: &str, cost: u64, frequency: u64) -> Product {
        Product {
            id: ProductId(1),
            device: Address::from("device"),
            name: "sensor".to_string(),
            description: String::new(),
            data_type: data_type.to_string(),
            frequency,
            cost,
        }
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let query = ProductSearchQuery::default();
        assert!(query.matches(&product("light", 5, 60)));
        assert!(query.matches(&product("", 0, 0)));
    }

    #[test]
    fn test_product_bounds() {
        let query = ProductSearchQuery {
            data_type: "light".to_string(),
            min_cost: 0,
            max_cost: 20,
            min_frequency: 1,
            max_frequency: 10,
        };
        assert!(query.matches(&product("light", 20, 10)));
        assert!(!query.matches(&product("humidity", 5, 5)));
        assert!(!query.matches(&product("light", 21, 5)));
        assert!(!query.matches(&product("light", 5, 0)));
        assert!(!query.matches(&product("light", 5, 11)));
    }

    #[test]
    fn test_broker_locations() {
        let broker = Broker {
            address: Address::from("broker"),
            name: "relay".to_string(),
            endpoint: "127.0.0.1:25565".to_string(),
            location: Location::Na,
        };
        assert!(BrokerSearchQuery::default().matches(&broker));
        assert!(BrokerSearchQuery { locations: vec![Location::Na, Location::Jp] }.matches(&broker));
        assert!(!BrokerSearchQuery { locations: vec![Location::Euw] }.matches(&broker));
    }
}
